//! Blocking scheduler: buffered, write-one-batch-ahead scoring.
//!
//! The highest-throughput path. The kernel handles flow control: writes go
//! through a buffered writer and reads block until the engine has answered
//! a whole batch. Overlap comes from staying one batch ahead — batch `B0`
//! is written at call entry, and each step writes `B(n+1)` before blocking
//! on the scores for `Bn`, so formatting and engine work run concurrently.
//!
//! The trade-off: a single large write that fills the stdin pipe can block
//! the thread for as long as the engine needs to drain it, so tail latency
//! is worse than the non-blocking path. Past the deadline no new batch is
//! written and no *new* blocking read is started; whole unread batches stay
//! in flight and are drained (scores discarded) at the start of the next
//! call.
//!
//! Also hosts the write-side operations that only make sense with blocking
//! pipes: `train` and the audit-mode `explain_line` exchange.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::process::{ChildStdin, ChildStdout};
use std::time::{Duration, Instant};

use crate::audit::{self, Explanation};
use crate::batch::fill_batch;
use crate::deadline::Deadline;
use crate::engine::{EngineConfig, EngineHandle};
use crate::errors::DriverError;
use crate::formatter::{DebugInfo, LineFormatter};
use crate::metrics::{record_event, DetailedMetrics, EventKind, PredictMetrics};
use crate::{parse_score, DriverConfig, PredictOptions};

/// Scoring driver over blocking pipes.
///
/// Not safe for concurrent calls; callers serialize or shard drivers.
pub struct BlockingDriver<F: LineFormatter> {
    handle: EngineHandle,
    formatter: F,
    config: DriverConfig,
    writer: BufWriter<ChildStdin>,
    reader: Option<BufReader<ChildStdout>>,
    /// Sizes of batches written but not yet read back, oldest first.
    /// Non-empty across calls only after a deadline-truncated call.
    in_flight: VecDeque<usize>,
}

impl<F: LineFormatter> BlockingDriver<F> {
    /// Spawns the engine and wires up the blocking driver.
    pub fn open(
        formatter: F,
        engine: EngineConfig,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        let (handle, pipes) = EngineHandle::spawn(&engine, false)?;
        Ok(Self {
            handle,
            formatter,
            config,
            writer: BufWriter::new(pipes.stdin),
            reader: pipes.stdout.map(BufReader::new),
            in_flight: VecDeque::new(),
        })
    }

    pub fn formatter(&self) -> &F {
        &self.formatter
    }

    /// Process liveness; false once the handle is poisoned.
    pub fn is_alive(&mut self) -> bool {
        self.handle.is_alive()
    }

    /// Retained tail of the engine's stderr.
    pub fn stderr_tail(&self) -> String {
        self.handle.stderr_tail()
    }

    /// Scores `items` against `ctx`, yielding scores lazily in input order.
    ///
    /// Returns up to `items.len()` scores; a deadline truncates the
    /// sequence without error. See [`Self::predict_opts`] for metrics and
    /// debug sinks.
    pub fn predict<'a>(
        &'a mut self,
        ctx: &'a F::Context,
        items: &'a [F::Item],
        timeout: Option<Duration>,
    ) -> Result<Predictions<'a, F>, DriverError> {
        self.predict_opts(
            ctx,
            items,
            PredictOptions {
                timeout,
                ..PredictOptions::default()
            },
        )
    }

    /// [`Self::predict`] with metrics and debug sinks.
    pub fn predict_opts<'a>(
        &'a mut self,
        ctx: &'a F::Context,
        items: &'a [F::Item],
        opts: PredictOptions<'a>,
    ) -> Result<Predictions<'a, F>, DriverError> {
        let start = Instant::now();
        let PredictOptions {
            timeout,
            mut metrics,
            detailed,
            debug,
        } = opts;

        self.check_scoring_ready()?;
        if let Some(metrics) = metrics.as_deref_mut() {
            metrics.reset();
        }

        // Residual drain: scores owed from a deadline-truncated earlier
        // call must come off the pipe before this call's first batch, or
        // they would be yielded as if they belonged to the new items.
        let mut drained = 0u64;
        while let Some(&n) = self.in_flight.front() {
            for _ in 0..n {
                self.read_score_line()?;
                drained += 1;
            }
            self.in_flight.pop_front();
        }
        if let Some(metrics) = metrics.as_deref_mut() {
            metrics.residual_lines_drained = drained;
        }

        let mut debug = debug;
        let common = self
            .formatter
            .common(ctx, debug.as_deref_mut())
            .map_err(DriverError::Format)?;

        let deadline = Deadline::from_timeout(start, timeout);
        let mut predictions = Predictions {
            driver: self,
            ctx,
            items,
            common,
            cursor: 0,
            deadline,
            write_deadline: deadline,
            ready: VecDeque::new(),
            start,
            finished: false,
            error: None,
            metrics,
            detailed,
            debug,
        };
        // Write B0 up front so the engine is busy while the caller starts
        // consuming (and while we format B1).
        predictions.write_next_batch()?;
        Ok(predictions)
    }

    /// Streams training lines to the engine.
    ///
    /// `labels` must match `items` in length; `weights`, when given, too.
    /// Unless the handle is write-only, the engine's responses are read
    /// back and discarded to keep the pipe aligned for later calls.
    pub fn train(
        &mut self,
        ctx: &F::Context,
        items: &[F::Item],
        labels: &[f64],
        weights: Option<&[f64]>,
        mut metrics: Option<&mut PredictMetrics>,
        mut debug: Option<&mut DebugInfo>,
    ) -> Result<(), DriverError> {
        self.check_training_ready()?;
        if labels.len() != items.len() {
            return Err(DriverError::bad_input(format!(
                "labels length {} != items length {}",
                labels.len(),
                items.len()
            )));
        }
        if let Some(weights) = weights {
            if weights.len() != items.len() {
                return Err(DriverError::bad_input(format!(
                    "weights length {} != items length {}",
                    weights.len(),
                    items.len()
                )));
            }
        }
        if let Some(metrics) = metrics.as_deref_mut() {
            metrics.reset();
        }

        let common = self
            .formatter
            .common(ctx, debug.as_deref_mut())
            .map_err(DriverError::Format)?;

        let mut batch = Vec::with_capacity(self.config.slab_bytes);
        let mut batch_lines = 0usize;
        for (i, item) in items.iter().enumerate() {
            let fragment = match self.formatter.item(ctx, item, debug.as_deref_mut()) {
                Ok(fragment) => fragment,
                Err(_) => {
                    if let Some(metrics) = metrics.as_deref_mut() {
                        metrics.format_errors += 1;
                    }
                    continue;
                }
            };
            let weight = weights.map(|w| w[i]);
            let line =
                self.formatter
                    .formatted_example(&common, &fragment, Some(labels[i]), weight);
            batch.extend_from_slice(line.as_bytes());
            batch.push(b'\n');
            batch_lines += 1;

            if batch_lines >= self.config.batch_size {
                self.submit_training_batch(&batch, batch_lines, metrics.as_deref_mut())?;
                batch.clear();
                batch_lines = 0;
            }
        }
        if batch_lines > 0 {
            self.submit_training_batch(&batch, batch_lines, metrics.as_deref_mut())?;
        }

        // Drain every remaining response so the next call starts clean.
        while let Some(n) = self.in_flight.pop_front() {
            for _ in 0..n {
                self.read_score_line()?;
            }
        }
        Ok(())
    }

    /// Audit-mode single-line explanation.
    ///
    /// Writes one formatted line and parses the engine's two-line (or
    /// three-line, with `link_function`) audit response.
    pub fn explain_line(
        &mut self,
        line: &str,
        link_function: bool,
    ) -> Result<Explanation, DriverError> {
        if self.handle.is_poisoned() {
            return Err(DriverError::engine_gone("handle poisoned by earlier failure"));
        }
        if !self.handle.audit_mode() {
            return Err(DriverError::AuditModeInactive);
        }
        if !self.handle.is_alive() {
            return Err(self.handle.gone("engine not alive at call entry"));
        }
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DriverError::bad_input("audit handle has no read pipe"))?;

        match audit::exchange(&mut self.writer, reader, line, link_function) {
            Ok(explanation) => Ok(explanation),
            Err(err) => {
                if matches!(err, DriverError::EngineGone { .. }) {
                    self.handle.poison();
                }
                Err(err)
            }
        }
    }

    /// Gracefully shuts the engine down: closes stdin (EOF), drains any
    /// leftover stdout, waits a bounded grace period, force-kills on
    /// overrun.
    ///
    /// A poisoned handle closes successfully regardless of exit status.
    pub fn close(self) -> Result<(), DriverError> {
        let Self {
            mut handle,
            mut writer,
            reader,
            config,
            ..
        } = self;

        let _ = writer.flush();
        drop(writer); // EOF on the engine's stdin

        if let Some(mut reader) = reader {
            // Exhaust stdout so the engine cannot block on a full pipe
            // while exiting.
            let mut sink = Vec::new();
            let _ = reader.read_to_end(&mut sink);
        }

        let was_poisoned = handle.is_poisoned();
        let status = handle.reap(config.reap_grace)?;
        if !was_poisoned && !status.success() {
            return Err(DriverError::engine_gone(format!(
                "engine exited with {status}"
            )));
        }
        Ok(())
    }

    fn check_scoring_ready(&mut self) -> Result<(), DriverError> {
        if self.handle.is_poisoned() {
            return Err(DriverError::engine_gone("handle poisoned by earlier failure"));
        }
        if self.handle.audit_mode() {
            return Err(DriverError::AuditModeActive);
        }
        if self.handle.write_only() {
            return Err(DriverError::WriteOnly);
        }
        if !self.handle.is_alive() {
            return Err(self.handle.gone("engine not alive at call entry"));
        }
        Ok(())
    }

    fn check_training_ready(&mut self) -> Result<(), DriverError> {
        if self.handle.is_poisoned() {
            return Err(DriverError::engine_gone("handle poisoned by earlier failure"));
        }
        if self.handle.audit_mode() {
            return Err(DriverError::AuditModeActive);
        }
        if !self.handle.is_alive() {
            return Err(self.handle.gone("engine not alive at call entry"));
        }
        Ok(())
    }

    fn submit_training_batch(
        &mut self,
        batch: &[u8],
        lines: usize,
        mut metrics: Option<&mut PredictMetrics>,
    ) -> Result<(), DriverError> {
        self.write_all_flush(batch)?;
        if let Some(metrics) = metrics.as_deref_mut() {
            metrics.batches_written += 1;
            metrics.lines_written += lines as u64;
        }
        if self.handle.write_only() {
            return Ok(());
        }
        self.in_flight.push_back(lines);
        // Stay one batch ahead: read responses for everything but the batch
        // just written.
        while self.in_flight.len() > 1 {
            let n = self.in_flight.pop_front().expect("checked non-empty");
            for _ in 0..n {
                self.read_score_line()?;
            }
        }
        Ok(())
    }

    fn write_all_flush(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        let result = self
            .writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush());
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(self.handle.gone("engine stdin closed mid-write"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Blocking read of exactly one score line.
    fn read_score_line(&mut self) -> Result<f64, DriverError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| DriverError::bad_input("no read pipe on this handle"))?;
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(DriverError::from_pipe_io)?;
        if n == 0 {
            return Err(self.handle.gone("EOF on score stream"));
        }
        match parse_score(&line) {
            Some(score) => Ok(score),
            None => Err(self
                .handle
                .gone(format!("unparseable score line {:?}", line.trim_end()))),
        }
    }
}

/// Lazy score sequence for one blocking `predict` call.
///
/// Dropping the iterator early behaves like the deadline passing: no
/// further batches are written, and unread in-flight batches become the
/// next call's residual drain.
pub struct Predictions<'a, F: LineFormatter> {
    driver: &'a mut BlockingDriver<F>,
    ctx: &'a F::Context,
    items: &'a [F::Item],
    common: String,
    cursor: usize,
    deadline: Deadline,
    write_deadline: Deadline,
    ready: VecDeque<f64>,
    start: Instant,
    finished: bool,
    /// Terminal failure, yielded once the ready queue is empty so scores
    /// read before the failure are not lost.
    error: Option<DriverError>,
    metrics: Option<&'a mut PredictMetrics>,
    detailed: Option<&'a mut DetailedMetrics>,
    debug: Option<&'a mut DebugInfo>,
}

impl<F: LineFormatter> Predictions<'_, F> {
    /// Formats and writes the next batch, if items remain and the write
    /// window is open.
    fn write_next_batch(&mut self) -> Result<(), DriverError> {
        if self.cursor >= self.items.len() || self.write_deadline.expired() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(self.driver.config.slab_bytes);
        record_event(&mut self.detailed, EventKind::FormatBegin, 0);
        let outcome = fill_batch(
            &self.driver.formatter,
            self.ctx,
            self.items,
            &mut self.cursor,
            &self.common,
            &mut batch,
            self.driver.config.batch_size,
            usize::MAX, // blocking writes are not bound by the pipe capacity
            &self.write_deadline,
            self.debug.as_deref_mut(),
        );
        record_event(&mut self.detailed, EventKind::FormatEnd, outcome.lines as u64);
        if let Some(metrics) = self.metrics.as_deref_mut() {
            metrics.format_errors += outcome.skipped as u64;
        }
        if outcome.lines == 0 {
            return Ok(());
        }

        record_event(&mut self.detailed, EventKind::WriteBegin, batch.len() as u64);
        self.driver.write_all_flush(&batch)?;
        record_event(&mut self.detailed, EventKind::WriteEnd, batch.len() as u64);

        self.driver.in_flight.push_back(outcome.lines);
        if let Some(metrics) = self.metrics.as_deref_mut() {
            metrics.batches_written += 1;
            metrics.lines_written += outcome.lines as u64;
        }
        Ok(())
    }

    /// One scheduler step: write the next batch, then block on the scores
    /// for the oldest in-flight batch.
    fn step(&mut self) -> Result<(), DriverError> {
        self.write_next_batch()?;

        if self.driver.in_flight.is_empty() {
            self.finished = true;
            return Ok(());
        }
        if self.deadline.expired() {
            // Do not start a new blocking read past the deadline; the
            // in-flight batches become residuals.
            record_event(&mut self.detailed, EventKind::DeadlineReached, 0);
            self.finished = true;
            return Ok(());
        }

        let n = self.driver.in_flight.pop_front().expect("checked non-empty");
        record_event(&mut self.detailed, EventKind::ReadBegin, n as u64);
        for _ in 0..n {
            let score = self.driver.read_score_line()?;
            self.ready.push_back(score);
            if let Some(metrics) = self.metrics.as_deref_mut() {
                metrics.lines_read += 1;
            }
        }
        record_event(&mut self.detailed, EventKind::ReadEnd, n as u64);
        Ok(())
    }
}

impl<F: LineFormatter> Iterator for Predictions<'_, F> {
    type Item = Result<f64, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(score) = self.ready.pop_front() {
                return Some(Ok(score));
            }
            if let Some(err) = self.error.take() {
                return Some(Err(err));
            }
            if self.finished {
                return None;
            }
            if let Err(err) = self.step() {
                self.finished = true;
                self.error = Some(err);
            }
        }
    }
}

impl<F: LineFormatter> Drop for Predictions<'_, F> {
    fn drop(&mut self) {
        if let Some(metrics) = self.metrics.as_deref_mut() {
            metrics.elapsed_ns = self.start.elapsed().as_nanos() as u64;
        }
    }
}
