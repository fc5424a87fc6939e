//! Blocking scheduler end-to-end behavior.

use std::time::{Duration, Instant};

use scorepipe_rs::errors::FormatError;
use scorepipe_rs::{
    BlockingDriver, DebugInfo, DriverConfig, DriverError, LineFormatter, PassthroughFormatter,
    PredictMetrics, PredictOptions,
};

use crate::fake_engine;

fn collect(iter: impl Iterator<Item = Result<f64, DriverError>>) -> Vec<f64> {
    iter.map(|r| r.expect("score")).collect()
}

#[test]
fn happy_path_scores_all_items_in_order() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(3);
    let mut metrics = PredictMetrics::default();

    let start = Instant::now();
    let scores = collect(
        driver
            .predict_opts(
                &ctx,
                &items,
                PredictOptions {
                    timeout: Some(Duration::from_secs(5)),
                    metrics: Some(&mut metrics),
                    ..PredictOptions::default()
                },
            )
            .unwrap(),
    );

    assert_eq!(scores, vec![1.0, 2.0, 3.0]);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(metrics.lines_written, 3);
    assert_eq!(metrics.lines_read, 3);
    assert_eq!(metrics.batches_written, 1);
    assert_eq!(metrics.residual_lines_drained, 0);
    assert!(metrics.elapsed_ns > 0);

    driver.close().unwrap();
}

#[test]
fn multiple_batches_keep_input_order() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        DriverConfig {
            batch_size: 2,
            ..DriverConfig::default()
        },
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(7);
    let scores = collect(driver.predict(&ctx, &items, None).unwrap());
    assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);

    driver.close().unwrap();
}

#[test]
fn zero_items_writes_nothing() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items: Vec<String> = Vec::new();
    let mut metrics = PredictMetrics::default();

    let start = Instant::now();
    let scores = collect(
        driver
            .predict_opts(
                &ctx,
                &items,
                PredictOptions {
                    timeout: Some(Duration::from_millis(5)),
                    metrics: Some(&mut metrics),
                    ..PredictOptions::default()
                },
            )
            .unwrap(),
    );

    assert!(scores.is_empty());
    assert_eq!(metrics.lines_written, 0);
    assert!(start.elapsed() < fake_engine::loose_bound(Duration::from_millis(5)));

    driver.close().unwrap();
}

#[test]
fn zero_timeout_yields_nothing_and_submits_nothing() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(10);
    let mut metrics = PredictMetrics::default();

    let scores = collect(
        driver
            .predict_opts(
                &ctx,
                &items,
                PredictOptions {
                    timeout: Some(Duration::ZERO),
                    metrics: Some(&mut metrics),
                    ..PredictOptions::default()
                },
            )
            .unwrap(),
    );
    assert!(scores.is_empty());
    assert_eq!(metrics.lines_written, 0);

    // The driver is still usable afterwards.
    let scores = collect(driver.predict(&ctx, &items, None).unwrap());
    assert_eq!(scores.len(), 10);

    driver.close().unwrap();
}

#[test]
fn deadline_truncates_to_an_ordered_prefix() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::slow_counting("0.01"),
        DriverConfig {
            batch_size: 5,
            ..DriverConfig::default()
        },
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(40);

    let start = Instant::now();
    let scores = collect(
        driver
            .predict(&ctx, &items, Some(Duration::from_millis(80)))
            .unwrap(),
    );
    let elapsed = start.elapsed();

    assert!(!scores.is_empty(), "engine should score at least one batch");
    assert!(scores.len() < items.len(), "deadline should truncate");
    // Prefix of the full sequence, in order.
    for (i, score) in scores.iter().enumerate() {
        assert_eq!(*score, (i + 1) as f64);
    }
    // Blocking epsilon: deadline plus roughly one batch read time.
    assert!(elapsed < Duration::from_millis(80) + Duration::from_secs(1));

    driver.close().unwrap();
}

#[test]
fn early_drop_leaves_residuals_for_the_next_call() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        DriverConfig {
            batch_size: 2,
            ..DriverConfig::default()
        },
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(6);

    {
        let mut predictions = driver.predict(&ctx, &items, None).unwrap();
        assert_eq!(predictions.next().unwrap().unwrap(), 1.0);
        // Dropped here with batches still in flight.
    }

    let mut metrics = PredictMetrics::default();
    let scores = collect(
        driver
            .predict_opts(
                &ctx,
                &items,
                PredictOptions {
                    metrics: Some(&mut metrics),
                    ..PredictOptions::default()
                },
            )
            .unwrap(),
    );

    // The abandoned batches were drained, so the new call's scores stay
    // aligned with its own items.
    assert_eq!(scores.len(), 6);
    assert!(metrics.residual_lines_drained > 0);
    let first = scores[0];
    for (i, score) in scores.iter().enumerate() {
        assert_eq!(*score, first + i as f64, "scores must stay consecutive");
    }

    driver.close().unwrap();
}

struct FailOdds;

impl LineFormatter for FailOdds {
    type Context = String;
    type Item = usize;

    fn common(
        &self,
        ctx: &String,
        _debug: Option<&mut DebugInfo>,
    ) -> Result<String, FormatError> {
        Ok(ctx.clone())
    }

    fn item(
        &self,
        _ctx: &String,
        item: &usize,
        _debug: Option<&mut DebugInfo>,
    ) -> Result<String, FormatError> {
        if item % 2 == 1 {
            Err(FormatError::new("odd items are unformattable"))
        } else {
            Ok(format!("|b i{item}"))
        }
    }
}

#[test]
fn formatter_failures_skip_and_count() {
    let mut driver = BlockingDriver::open(
        FailOdds,
        fake_engine::counting(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = "|a u1".to_string();
    let items: Vec<usize> = (0..8).collect();
    let mut metrics = PredictMetrics::default();

    let scores = collect(
        driver
            .predict_opts(
                &ctx,
                &items,
                PredictOptions {
                    metrics: Some(&mut metrics),
                    ..PredictOptions::default()
                },
            )
            .unwrap(),
    );

    assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(metrics.format_errors, 4);
    assert_eq!(metrics.lines_written, 4);

    driver.close().unwrap();
}

#[test]
fn write_only_handle_rejects_predict_but_trains() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::sh("cat >/dev/null").write_only(true),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(3);
    let err = driver.predict(&ctx, &items, None).err().expect("must fail");
    assert!(matches!(err, DriverError::WriteOnly));

    driver
        .train(&ctx, &items, &[1.0, 0.0, 1.0], None, None, None)
        .unwrap();
    driver.close().unwrap();
}

#[test]
fn train_reads_back_responses_on_a_scoring_handle() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        DriverConfig {
            batch_size: 2,
            ..DriverConfig::default()
        },
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(5);
    let mut metrics = PredictMetrics::default();
    driver
        .train(
            &ctx,
            &items,
            &[1.0, 0.0, 1.0, 0.0, 1.0],
            Some(&[0.5, 1.0, 0.5, 1.0, 0.5]),
            Some(&mut metrics),
            None,
        )
        .unwrap();
    assert_eq!(metrics.lines_written, 5);

    // The pipe is aligned: a following predict sees consecutive scores.
    let scores = collect(driver.predict(&ctx, &items, None).unwrap());
    assert_eq!(scores.len(), 5);
    let first = scores[0];
    for (i, score) in scores.iter().enumerate() {
        assert_eq!(*score, first + i as f64);
    }

    driver.close().unwrap();
}

#[test]
fn train_rejects_mismatched_labels() {
    let mut driver = BlockingDriver::open(
        PassthroughFormatter,
        fake_engine::counting(),
        fake_engine::small_config(),
    )
    .unwrap();

    let ctx = fake_engine::ctx();
    let items = fake_engine::items(3);
    let err = driver
        .train(&ctx, &items, &[1.0, 0.0], None, None, None)
        .unwrap_err();
    assert!(matches!(err, DriverError::BadInput { .. }));

    driver.close().unwrap();
}
