//! Deadline arithmetic for a single scoring call.
//!
//! A [`Deadline`] is an absolute monotonic instant derived from
//! `now + timeout` at call entry. Every scheduling decision works off the
//! remaining budget `deadline - now`; a missing timeout is represented as a
//! deadline that never expires so callers don't special-case it.
//!
//! # Invariants
//! - `remaining()` is `None` only for the unbounded deadline.
//! - Once `expired()` returns true it never returns false again
//!   (monotonic clock).

use std::time::{Duration, Instant};

/// Absolute monotonic cutoff for one call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Derives the deadline from an optional timeout, anchored at `start`.
    ///
    /// `None` yields an unbounded deadline; `Some(Duration::ZERO)` yields a
    /// deadline that is already expired ("drain only").
    pub(crate) fn from_timeout(start: Instant, timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| start + t),
        }
    }

    /// Unbounded deadline (never expires).
    pub(crate) fn unbounded() -> Self {
        Self { at: None }
    }

    /// True once the budget is exhausted.
    #[inline]
    pub(crate) fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Remaining budget, `None` when unbounded. Saturates at zero.
    #[inline]
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// A deadline `guard` earlier than this one, used to stop producing new
    /// work slightly before the hard cutoff. Unbounded stays unbounded.
    pub(crate) fn earlier_by(&self, guard: Duration) -> Self {
        Self {
            at: self.at.map(|at| at.checked_sub(guard).unwrap_or(at)),
        }
    }

    /// Poll timeout for one tick: the remaining budget capped at `slice`.
    ///
    /// Unbounded deadlines poll for a full `slice` so the loop stays
    /// responsive to readiness without busy-spinning.
    #[inline]
    pub(crate) fn poll_timeout(&self, slice: Duration) -> Duration {
        match self.remaining() {
            Some(rem) => rem.min(slice),
            None => slice,
        }
    }
}
