//! Integration tests for the scoring driver, run against shell-script fake
//! engines.
//!
//! Run with: `cargo test --test integration`

#![cfg(unix)]


mod blocking_predict;
mod lifecycle;
