//! Metrics sinks for scoring calls.
//!
//! Two tiers, both optional and off by default:
//!
//! - [`PredictMetrics`]: per-call integer counters. Updates are plain adds
//!   on the hot path; callers reuse one instance across calls and `reset()`
//!   between them, or merge snapshots for aggregation.
//! - [`DetailedMetrics`]: an append-only timeline of `(ns offset, kind,
//!   value)` events. Each event costs one vector push; the timeline is
//!   meant for offline profiling of a single call, not steady-state
//!   monitoring.
//!
//! Both types serialize with serde so failed-call artifacts can be dumped
//! alongside other diagnostics.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Per-call counters worth monitoring in production.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictMetrics {
    /// Batches handed to the write path.
    pub batches_written: u64,
    /// Complete lines accepted by the engine's stdin pipe.
    pub lines_written: u64,
    /// Score lines parsed from the engine's stdout.
    pub lines_read: u64,
    /// Readiness polls issued (non-blocking scheduler only).
    pub poll_calls: u64,
    /// Residual scores from earlier calls drained (and discarded) before
    /// this call started its own work.
    pub residual_lines_drained: u64,
    /// Items skipped under the skip-and-count formatter failure policy.
    pub format_errors: u64,
    /// Wall-clock duration of the call in nanoseconds.
    pub elapsed_ns: u64,
}

impl PredictMetrics {
    /// Clears all counters for reuse across calls.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds another snapshot into this one (saturating).
    pub fn merge(&mut self, other: &Self) {
        self.batches_written = self.batches_written.saturating_add(other.batches_written);
        self.lines_written = self.lines_written.saturating_add(other.lines_written);
        self.lines_read = self.lines_read.saturating_add(other.lines_read);
        self.poll_calls = self.poll_calls.saturating_add(other.poll_calls);
        self.residual_lines_drained = self
            .residual_lines_drained
            .saturating_add(other.residual_lines_drained);
        self.format_errors = self.format_errors.saturating_add(other.format_errors);
        self.elapsed_ns = self.elapsed_ns.saturating_add(other.elapsed_ns);
    }
}

/// What happened at one point of a call's timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Batch formatting started.
    FormatBegin,
    /// Batch formatting finished; value = lines produced.
    FormatEnd,
    /// A write attempt started; value = bytes pending.
    WriteBegin,
    /// A write attempt finished; value = bytes accepted by the kernel.
    WriteEnd,
    /// A read attempt started.
    ReadBegin,
    /// A read attempt finished; value = bytes received.
    ReadEnd,
    /// A readiness poll returned; value = 1 if anything was ready.
    PollReturn,
    /// The call's deadline was observed as expired.
    DeadlineReached,
}

/// One timeline entry: nanoseconds since the sink was created, the event
/// kind, and an event-specific value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub at_ns: u64,
    pub kind: EventKind,
    pub value: u64,
}

/// Append-only event timeline for profiling a single call.
#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedMetrics {
    #[serde(skip, default = "Instant::now")]
    origin: Instant,
    events: Vec<MetricEvent>,
}

impl Default for DetailedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DetailedMetrics {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            events: Vec::new(),
        }
    }

    /// Records one event. Cost: one `Vec` push.
    #[inline]
    pub fn record(&mut self, kind: EventKind, value: u64) {
        let at_ns = self.origin.elapsed().as_nanos() as u64;
        self.events.push(MetricEvent { at_ns, kind, value });
    }

    /// The recorded timeline, in append order.
    pub fn events(&self) -> &[MetricEvent] {
        &self.events
    }

    /// Drops all recorded events; the time origin is preserved.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Records into an optional detailed sink without branching at call sites.
#[inline]
pub(crate) fn record_event(sink: &mut Option<&mut DetailedMetrics>, kind: EventKind, value: u64) {
    if let Some(sink) = sink.as_deref_mut() {
        sink.record(kind, value);
    }
}
