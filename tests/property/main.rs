//! Property-based tests.
//!
//! Run with: `cargo test --test property`

mod audit_roundtrip;
