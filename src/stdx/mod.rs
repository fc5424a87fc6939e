//! Small, self-contained data structures used across the driver.
//!
//! `stdx` hosts narrow, allocation-light utilities with fixed capacity and
//! deterministic behavior under overflow.

mod tail_ring;

pub(crate) use tail_ring::TailRing;
