//! Non-blocking scheduler: deadline-driven scoring over `O_NONBLOCK` pipes.
//!
//! The tail-latency path. Both pipe endpoints run in non-blocking mode and
//! the loop is driven by level-triggered readiness polls, so the longest
//! any single operation can wait is one poll slice (default 1 ms). Wall
//! time past the deadline is bounded by that slice plus one syscall.
//!
//! Per tick: check the deadline, format the next chunk just-in-time when
//! the send buffer is empty (bounded by the slab size so a batch never
//! exceeds the pipe capacity), poll both descriptors with the remaining
//! budget capped at the poll slice, drain whatever stdout has, and push
//! whatever stdin will take — advancing the written-lines count only by
//! newlines the kernel actually accepted, with any partial line staying in
//! the send buffer.
//!
//! # Cross-call bookkeeping
//!
//! A deadline drop-out leaves the engine owing scores (`engine_owes`) and
//! possibly a partially-written tail. Both persist on the driver, and every
//! call first flushes the tail and drains owed scores (discarding them)
//! before submitting its own items — the engine's output stream must stay
//! aligned with the driver's notion of input history. A call that spends
//! its whole budget on this drain legitimately yields zero scores. With a
//! zero timeout exactly one opportunistic flush-and-sweep pass runs and no
//! poll is issued.
//!
//! The cost of all this: slightly smaller effective batches, so mean
//! throughput trails the blocking path by roughly 10-15%.
//!
//! Unix only.

use std::collections::VecDeque;
use std::io::{BufReader, Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{ChildStdin, ChildStdout};
use std::time::{Duration, Instant};

use memchr::{memchr, memchr_iter};

use crate::audit::{self, Explanation};
use crate::batch::fill_batch;
use crate::deadline::Deadline;
use crate::engine::{EngineConfig, EngineHandle};
use crate::errors::DriverError;
use crate::formatter::LineFormatter;
use crate::metrics::{record_event, DetailedMetrics, EventKind, PredictMetrics};
use crate::poll::poll_duplex;
use crate::{parse_score, DriverConfig, PredictOptions};

/// Read syscall granularity for the score stream.
const READ_CHUNK: usize = 64 * 1024;

/// Scoring driver over non-blocking pipes.
///
/// Not safe for concurrent calls; callers serialize or shard drivers.
pub struct NonBlockingDriver<F: LineFormatter> {
    handle: EngineHandle,
    formatter: F,
    config: DriverConfig,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    /// Bytes handed to the write path but not yet accepted by the kernel.
    /// May end mid-line.
    unwritten: Vec<u8>,
    /// Bytes received from stdout that lack a terminating newline.
    unparsed: Vec<u8>,
    /// Scores the engine owes us: complete lines written minus score lines
    /// read, across all calls.
    engine_owes: u64,
}

impl<F: LineFormatter> NonBlockingDriver<F> {
    /// Spawns the engine with non-blocking pipes and wires up the driver.
    ///
    /// Write-only handles are a blocking-path concern and are rejected. In
    /// audit mode the pipes stay blocking and only [`Self::explain_line`]
    /// is available.
    pub fn open(
        formatter: F,
        engine: EngineConfig,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        if engine.write_only {
            return Err(DriverError::bad_input(
                "write-only handles use the blocking driver",
            ));
        }
        let (handle, pipes) = EngineHandle::spawn(&engine, true)?;
        let stdin = pipes.stdin;
        let stdout = pipes
            .stdout
            .ok_or_else(|| DriverError::bad_input("engine spawned without stdout pipe"))?;
        let stdin_fd = stdin.as_raw_fd();
        let stdout_fd = stdout.as_raw_fd();
        Ok(Self {
            handle,
            formatter,
            config,
            stdin,
            stdout,
            stdin_fd,
            stdout_fd,
            unwritten: Vec::new(),
            unparsed: Vec::new(),
            engine_owes: 0,
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

    /// Scores the engine still owes from deadline-truncated calls.
    pub fn engine_owes(&self) -> u64 {
        self.engine_owes
    }

    /// Scores `items` against `ctx`, yielding scores lazily in input order
    /// until the timeout elapses.
    ///
    /// `None` means no deadline; `Some(Duration::ZERO)` drains residuals
    /// opportunistically and yields nothing.
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
            mut detailed,
            debug,
        } = opts;

        if self.handle.is_poisoned() {
            return Err(DriverError::engine_gone("handle poisoned by earlier failure"));
        }
        if self.handle.audit_mode() {
            return Err(DriverError::AuditModeActive);
        }
        if !self.handle.is_alive() {
            return Err(self.handle.gone("engine not alive at call entry"));
        }
        if let Some(metrics) = metrics.as_deref_mut() {
            metrics.reset();
        }

        let deadline = Deadline::from_timeout(start, timeout);
        self.drain_residuals(&deadline, &mut metrics, &mut detailed)?;
        let clean = self.engine_owes == 0 && self.unwritten.is_empty();

        let mut debug = debug;
        let common = self
            .formatter
            .common(ctx, debug.as_deref_mut())
            .map_err(DriverError::Format)?;

        let write_deadline = deadline.earlier_by(self.config.write_guard);
        Ok(Predictions {
            driver: self,
            ctx,
            items,
            common,
            cursor: 0,
            lines_submitted: 0,
            lines_read: 0,
            send_buf: Vec::new(),
            deadline,
            write_deadline,
            ready: VecDeque::new(),
            start,
            // A call that could not clear its predecessor's debt submits
            // nothing of its own.
            finished: !clean,
            error: None,
            metrics,
            detailed,
            debug,
        })
    }

    /// Audit-mode single-line explanation. See
    /// [`BlockingDriver::explain_line`](crate::blocking::BlockingDriver::explain_line).
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

        // Audit pipes are blocking; the exchange is strict request/response
        // so a per-call reader cannot strand buffered bytes.
        let mut reader = BufReader::new(&mut self.stdout);
        match audit::exchange(&mut self.stdin, &mut reader, line, link_function) {
            Ok(explanation) => Ok(explanation),
            Err(err) => {
                if matches!(err, DriverError::EngineGone { .. }) {
                    self.handle.poison();
                }
                Err(err)
            }
        }
    }

    /// Gracefully shuts the engine down: closes stdin, drains stdout until
    /// EOF or the grace period elapses, reaps the child (killing it on
    /// overrun).
    ///
    /// A poisoned handle closes successfully regardless of exit status.
    pub fn close(self) -> Result<(), DriverError> {
        let Self {
            mut handle,
            stdin,
            mut stdout,
            stdout_fd,
            config,
            ..
        } = self;

        drop(stdin); // EOF on the engine's stdin

        let drain_deadline = Instant::now() + config.reap_grace;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if Instant::now() >= drain_deadline {
                break;
            }
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    let _ = poll_duplex(stdout_fd, None, Duration::from_millis(10));
                }
                Err(_) => break,
            }
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

    /// Flushes the unwritten tail and drains owed scores (discarding them)
    /// until the driver is clean or the deadline expires.
    ///
    /// Runs at least one opportunistic flush-and-sweep pass even on an
    /// already-expired deadline, so `timeout == 0` still consumes whatever
    /// is immediately drainable.
    fn drain_residuals(
        &mut self,
        deadline: &Deadline,
        metrics: &mut Option<&mut PredictMetrics>,
        detailed: &mut Option<&mut DetailedMetrics>,
    ) -> Result<(), DriverError> {
        loop {
            if self.engine_owes == 0 && self.unwritten.is_empty() {
                return Ok(());
            }

            if !self.unwritten.is_empty() {
                let buf = mem::take(&mut self.unwritten);
                let (accepted, lines) = self.write_some(&buf, detailed)?;
                self.unwritten = buf;
                self.unwritten.drain(..accepted);
                self.engine_owes += lines;
                if let Some(metrics) = metrics.as_deref_mut() {
                    metrics.lines_written += lines;
                }
            }

            let drained = self.sweep_scores(detailed, |_score| {})?;
            if let Some(metrics) = metrics.as_deref_mut() {
                metrics.residual_lines_drained += drained;
            }

            if self.engine_owes == 0 && self.unwritten.is_empty() {
                return Ok(());
            }
            if deadline.expired() {
                return Ok(());
            }

            let want_write = !self.unwritten.is_empty();
            let ready = poll_duplex(
                self.stdout_fd,
                want_write.then_some(self.stdin_fd),
                deadline.poll_timeout(self.config.poll_slice),
            )?;
            if let Some(metrics) = metrics.as_deref_mut() {
                metrics.poll_calls += 1;
            }
            record_event(detailed, EventKind::PollReturn, ready.any() as u64);
        }
    }

    /// One non-blocking write attempt. Returns bytes accepted and the
    /// number of complete lines among them.
    fn write_some(
        &mut self,
        buf: &[u8],
        detailed: &mut Option<&mut DetailedMetrics>,
    ) -> Result<(usize, u64), DriverError> {
        record_event(detailed, EventKind::WriteBegin, buf.len() as u64);
        match self.stdin.write(buf) {
            Ok(n) => {
                record_event(detailed, EventKind::WriteEnd, n as u64);
                let lines = memchr_iter(b'\n', &buf[..n]).count() as u64;
                Ok((n, lines))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                record_event(detailed, EventKind::WriteEnd, 0);
                Ok((0, 0))
            }
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(self.handle.gone("engine stdin closed mid-write"))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// One non-blocking read attempt: appends to the unparsed tail, splits
    /// complete lines, parses each score, decrements `engine_owes`, and
    /// hands each score to `sink`. Returns the number of scores parsed.
    fn sweep_scores(
        &mut self,
        detailed: &mut Option<&mut DetailedMetrics>,
        mut sink: impl FnMut(f64),
    ) -> Result<u64, DriverError> {
        record_event(detailed, EventKind::ReadBegin, 0);
        let mut buf = [0u8; READ_CHUNK];
        match self.stdout.read(&mut buf) {
            Ok(0) => {
                record_event(detailed, EventKind::ReadEnd, 0);
                return Err(self.handle.gone("EOF on score stream"));
            }
            Ok(n) => {
                record_event(detailed, EventKind::ReadEnd, n as u64);
                self.unparsed.extend_from_slice(&buf[..n]);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                record_event(detailed, EventKind::ReadEnd, 0);
                return Ok(0);
            }
            Err(err) => return Err(DriverError::from_pipe_io(err)),
        }

        let mut parsed = 0u64;
        let mut consumed = 0usize;
        while let Some(pos) = memchr(b'\n', &self.unparsed[consumed..]) {
            let line_end = consumed + pos;
            let line = &self.unparsed[consumed..line_end];
            consumed = line_end + 1;

            let text = match std::str::from_utf8(line) {
                Ok(text) => text,
                Err(_) => {
                    return Err(self.handle.gone("non-UTF-8 bytes on score stream"));
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            match parse_score(text) {
                Some(score) => {
                    self.engine_owes = self.engine_owes.saturating_sub(1);
                    parsed += 1;
                    sink(score);
                }
                None => {
                    return Err(self
                        .handle
                        .gone(format!("unparseable score line {text:?}")));
                }
            }
        }
        self.unparsed.drain(..consumed);
        Ok(parsed)
    }
}

/// Lazy score sequence for one non-blocking `predict` call.
///
/// Dropping the iterator early behaves like the deadline passing: no
/// further writes happen, a partially-written batch tail is parked on the
/// driver, and unread scores become the next call's residual drain.
pub struct Predictions<'a, F: LineFormatter> {
    driver: &'a mut NonBlockingDriver<F>,
    ctx: &'a F::Context,
    items: &'a [F::Item],
    common: String,
    /// Items consumed by the batch builder (`items_formatted`).
    cursor: usize,
    /// Complete lines this call has placed into the send buffer.
    lines_submitted: usize,
    /// Score lines this call has parsed.
    lines_read: usize,
    send_buf: Vec<u8>,
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
    debug: Option<&'a mut crate::formatter::DebugInfo>,
}

impl<F: LineFormatter> Predictions<'_, F> {
    /// One scheduler tick. Never blocks longer than one poll slice.
    fn tick(&mut self) -> Result<(), DriverError> {
        if self.deadline.expired() {
            record_event(&mut self.detailed, EventKind::DeadlineReached, 0);
            self.park();
            return Ok(());
        }

        // Clean completion: everything submitted has been read, nothing is
        // pending, and either all items went out or the write window shut.
        let all_read = self.lines_read == self.lines_submitted && self.send_buf.is_empty();
        if all_read && (self.cursor >= self.items.len() || self.write_deadline.expired()) {
            self.finished = true;
            return Ok(());
        }

        // Just-in-time formatting, bounded by the slab so a batch can
        // always fit the pipe, and by the pending-lines cap so a drop-out
        // leaves a bounded residual.
        if self.send_buf.is_empty()
            && self.cursor < self.items.len()
            && !self.write_deadline.expired()
        {
            let in_flight = self.lines_submitted - self.lines_read;
            if in_flight < self.driver.config.max_pending_lines {
                let max_lines = self
                    .driver
                    .config
                    .batch_size
                    .min(self.driver.config.max_pending_lines - in_flight);
                record_event(&mut self.detailed, EventKind::FormatBegin, 0);
                let outcome = fill_batch(
                    &self.driver.formatter,
                    self.ctx,
                    self.items,
                    &mut self.cursor,
                    &self.common,
                    &mut self.send_buf,
                    max_lines,
                    self.driver.config.slab_bytes,
                    &self.write_deadline,
                    self.debug.as_deref_mut(),
                );
                record_event(&mut self.detailed, EventKind::FormatEnd, outcome.lines as u64);
                self.lines_submitted += outcome.lines;
                if let Some(metrics) = self.metrics.as_deref_mut() {
                    metrics.format_errors += outcome.skipped as u64;
                    if outcome.lines > 0 {
                        metrics.batches_written += 1;
                    }
                }
            }
        }

        let want_write = !self.send_buf.is_empty();
        let ready = poll_duplex(
            self.driver.stdout_fd,
            want_write.then_some(self.driver.stdin_fd),
            self.deadline.poll_timeout(self.driver.config.poll_slice),
        )?;
        if let Some(metrics) = self.metrics.as_deref_mut() {
            metrics.poll_calls += 1;
        }
        record_event(&mut self.detailed, EventKind::PollReturn, ready.any() as u64);

        if ready.readable {
            let queue = &mut self.ready;
            let mut parsed = 0u64;
            self.driver.sweep_scores(&mut self.detailed, |score| {
                queue.push_back(score);
                parsed += 1;
            })?;
            self.lines_read += parsed as usize;
            if let Some(metrics) = self.metrics.as_deref_mut() {
                metrics.lines_read += parsed;
            }
        }

        if ready.writable && !self.send_buf.is_empty() {
            let buf = mem::take(&mut self.send_buf);
            let (accepted, lines) = self.driver.write_some(&buf, &mut self.detailed)?;
            self.send_buf = buf;
            self.send_buf.drain(..accepted);
            self.driver.engine_owes += lines;
            if let Some(metrics) = self.metrics.as_deref_mut() {
                metrics.lines_written += lines;
            }
        }

        Ok(())
    }

    /// Ends the call, parking any unflushed bytes on the driver so the
    /// next call's residual drain can finish the job.
    fn park(&mut self) {
        self.finished = true;
        if !self.send_buf.is_empty() {
            debug_assert!(self.driver.unwritten.is_empty());
            self.driver.unwritten = mem::take(&mut self.send_buf);
        }
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
            if let Err(err) = self.tick() {
                // The handle is poisoned; buffered leftovers are garbage.
                self.finished = true;
                self.send_buf.clear();
                self.driver.unwritten.clear();
                self.driver.unparsed.clear();
                self.driver.engine_owes = 0;
                self.error = Some(err);
            }
        }
    }
}

impl<F: LineFormatter> Drop for Predictions<'_, F> {
    fn drop(&mut self) {
        self.park();
        if let Some(metrics) = self.metrics.as_deref_mut() {
            metrics.elapsed_ns = self.start.elapsed().as_nanos() as u64;
        }
    }
}
