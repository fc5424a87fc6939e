//! Latency-bounded batch scoring over a line-oriented child process.
//!
//! The driver wraps an external scoring engine — a long-running child that
//! reads newline-terminated request lines on stdin and answers one score
//! per line on stdout — and turns it into a deadline-respecting batch
//! predictor. A caller supplies an opaque context, a slice of opaque items,
//! and a timeout; the driver yields as many scores as fit inside the
//! budget, lazily, in input order.
//!
//! Two schedulers share the same engine handle, formatter contract, and
//! batch builder:
//!
//! - [`blocking::BlockingDriver`]: buffered, write-one-batch-ahead;
//!   best mean throughput, tail latency at the mercy of pipe flow control.
//!   Also carries `train` and write-only handles.
//! - [`nonblocking::NonBlockingDriver`] (Unix): `O_NONBLOCK` pipes driven
//!   by readiness polls; no syscall waits longer than one poll slice, so
//!   deadline overshoot is bounded by `poll_slice` plus one syscall.
//!
//! Flow for one predict call:
//!
//! ```text
//! caller -> formatter -> batch builder -> scheduler -> engine stdin
//!                                 scores  <- scheduler <- engine stdout
//! ```
//!
//! Partial results are normal: a deadline truncates the sequence without
//! error. Engine death is terminal: the handle is poisoned and every later
//! call fails fast with `EngineGone`. One driver instance serves one caller
//! at a time.

pub mod audit;
mod batch;
pub mod blocking;
mod deadline;
pub mod engine;
pub mod errors;
pub mod formatter;
pub mod metrics;
#[cfg(unix)]
pub mod nonblocking;
#[cfg(unix)]
mod poll;
mod stdx;

pub use audit::{AuditRecord, ExplainedFeature, Explanation, FeatureContribution};
pub use blocking::BlockingDriver;
pub use engine::EngineConfig;
pub use errors::{AuditParseError, DriverError, FormatError};
pub use formatter::{DebugInfo, LineFormatter, PassthroughFormatter};
pub use metrics::{DetailedMetrics, EventKind, MetricEvent, PredictMetrics};
#[cfg(unix)]
pub use nonblocking::NonBlockingDriver;

use std::time::Duration;

/// Default lines per batch (blocking path; the non-blocking path is
/// additionally bounded by [`DriverConfig::slab_bytes`]).
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default byte cap per non-blocking batch: one typical pipe buffer, so a
/// batch can always be parked in the kernel without blocking.
pub const DEFAULT_SLAB_BYTES: usize = 64 * 1024;

/// Default readiness-poll slice. Bounds every wait in the non-blocking
/// scheduler and therefore the deadline overshoot.
pub const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(1);

/// Tuning knobs shared by both schedulers.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Maximum lines per batch. The useful range is roughly 64..=2048;
    /// smaller batches shrink the residual left behind by a deadline
    /// drop-out, larger ones amortize syscalls.
    pub batch_size: usize,
    /// Byte cap per non-blocking batch. Keep at or below the stdin pipe
    /// capacity so a whole batch can sit in the kernel buffer.
    pub slab_bytes: usize,
    /// Cap on scores in flight (written but unread) in the non-blocking
    /// scheduler; bounds the residual a truncated call can leave.
    pub max_pending_lines: usize,
    /// Readiness-poll timeout slice (non-blocking scheduler).
    pub poll_slice: Duration,
    /// How long before the deadline the non-blocking scheduler stops
    /// producing new batches, leaving room for in-flight work to settle.
    pub write_guard: Duration,
    /// Grace period for the engine to exit after stdin EOF before it is
    /// force-killed.
    pub reap_grace: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            slab_bytes: DEFAULT_SLAB_BYTES,
            max_pending_lines: 2 * DEFAULT_BATCH_SIZE,
            poll_slice: DEFAULT_POLL_SLICE,
            write_guard: Duration::from_millis(1),
            reap_grace: Duration::from_secs(5),
        }
    }
}

/// Per-call options for `predict_opts`.
///
/// All sinks are optional and off by default; provided metrics are reset at
/// call entry.
#[derive(Default)]
pub struct PredictOptions<'a> {
    /// Scoring budget. `None` removes the deadline; `Some(Duration::ZERO)`
    /// means "drain only, submit nothing".
    pub timeout: Option<Duration>,
    /// Counter sink.
    pub metrics: Option<&'a mut PredictMetrics>,
    /// Event-timeline sink (costs one append per event).
    pub detailed: Option<&'a mut DetailedMetrics>,
    /// Formatter debug sink.
    pub debug: Option<&'a mut DebugInfo>,
}

/// Parses one score line: first whitespace-separated token as a finite
/// float.
pub(crate) fn parse_score(line: &str) -> Option<f64> {
    let token = line.split_whitespace().next()?;
    let score: f64 = token.parse().ok()?;
    score.is_finite().then_some(score)
}
