//! Engine lifecycle: spawn failures, unexpected death, poisoning, close.

#![cfg(unix)]

use std::time::{Duration, Instant};

use scorepipe_rs::{
    BlockingDriver, DriverError, NonBlockingDriver, PassthroughFormatter, PredictOptions,
};

use crate::fake_engine;

#[test]
fn spawn_failure_surfaces_as_io() {
    let err = BlockingDriver::open(
        PassthroughFormatter,
        scorepipe_rs::EngineConfig::new("/nonexistent-scoring-engine"),
        fake_engine::small_config(),
    )
    .err()
    .expect("spawn must fail");
    assert!(matches!(err, DriverError::Io(_)));
}

#[test]
fn engine_death_between_calls_poisons_the_handle() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::dies_after(2, 0),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(2);
    let scores: Vec<f64> = driver
        .predict(&ctx, &items, None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(scores, vec![1.0, 2.0]);

    // The engine exits after its second response; give it a moment.
    let deadline = Instant::now() + Duration::from_secs(2);
    while driver.is_alive() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!driver.is_alive());

    let err = driver.predict(&ctx, &items, None).err().expect("must fail");
    assert!(matches!(err, DriverError::EngineGone { .. }));

    // Poisoned handles fail fast from then on...
    let err = driver.predict(&ctx, &items, None).err().expect("must fail");
    assert!(matches!(err, DriverError::EngineGone { .. }));

    // ...but close still succeeds.
    driver.close().unwrap();
}

#[test]
fn engine_death_mid_call_aborts_with_engine_gone() {
    let mut driver = NonBlockingDriver::open(
        PassthroughFormatter,
        fake_engine::dies_after(2, 7),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(5);
    let mut results: Vec<Result<f64, DriverError>> = driver
        .predict(&ctx, &items, Some(Duration::from_secs(5)))
        .unwrap()
        .collect();

    let last = results.pop().expect("at least the error");
    assert!(matches!(last, Err(DriverError::EngineGone { .. })));
    let scores: Vec<f64> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(scores, vec![1.0, 2.0]);

    // Terminal: the next call fails without touching the pipes.
    let err = driver
        .predict(&ctx, &items, Some(Duration::from_millis(10)))
        .err()
        .expect("poisoned");
    assert!(matches!(err, DriverError::EngineGone { .. }));

    driver.close().unwrap();
}

#[test]
fn garbage_scores_are_engine_gone_with_stderr_context() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::sh(
            "echo 'model file missing' >&2; while read -r line; do echo \"not-a-score\"; done",
        ),
        fake_engine::small_config(),
    )
    .unwrap();

    // Let the stderr drain thread observe the engine's startup complaint.
    std::thread::sleep(Duration::from_millis(50));

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(2);
    let mut predictions = driver.predict(&ctx, &items, None).unwrap();
    let err = predictions.next().unwrap().unwrap_err();
    match &err {
        DriverError::EngineGone { detail } => {
            assert!(detail.contains("not-a-score"));
            assert!(detail.contains("model file missing"));
        }
        other => panic!("expected EngineGone, got {other:?}"),
    }
    assert!(predictions.next().is_none());
    drop(predictions);

    driver.close().unwrap();
}

#[test]
fn garbage_scores_poison_the_nonblocking_driver() {
    let mut driver = NonBlockingDriver::open(
        PassthroughFormatter,
        fake_engine::garbage(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(2);
    let results: Vec<Result<f64, DriverError>> = driver
        .predict(&ctx, &items, Some(Duration::from_secs(5)))
        .unwrap()
        .collect();
    assert!(matches!(
        results.last(),
        Some(Err(DriverError::EngineGone { .. }))
    ));
    assert_eq!(driver.engine_owes(), 0, "poisoned state is cleared");

    driver.close().unwrap();
}

#[test]
fn close_reaps_within_the_grace_period() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(4);
    let scores: Vec<f64> = driver
        .predict(&ctx, &items, None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(scores.len(), 4);

    let start = Instant::now();
    driver.close().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn close_kills_an_engine_that_ignores_eof() {
    let driver = NonBlockingDriver::open(
        PassthroughFormatter,
        // Ignores SIGTERM-able graceful paths: never reads, never exits.
        fake_engine::sh("exec sleep 600"),
        scorepipe_rs::DriverConfig {
            reap_grace: Duration::from_millis(100),
            ..fake_engine::small_config()
        },
    )
    .unwrap();

    let start = Instant::now();
    // The engine is killed after the grace period; its forced exit status
    // is reported since the handle was never poisoned.
    let result = driver.close();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(matches!(result, Err(DriverError::EngineGone { .. })));
}

#[test]
fn nonblocking_predict_on_dead_engine_fails_at_entry() {
    let mut driver = NonBlockingDriver::open(
        PassthroughFormatter,
        fake_engine::sh("exit 0"),
        fake_engine::small_config(),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while driver.is_alive() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(1);
    let err = driver
        .predict_opts(
            &ctx,
            &items,
            PredictOptions {
                timeout: Some(Duration::from_millis(10)),
                ..PredictOptions::default()
            },
        )
        .err()
        .expect("dead engine");
    assert!(matches!(err, DriverError::EngineGone { .. }));

    driver.close().unwrap();
}
