//! Resilience primitives.
//!
//! The broker connection loop retries forever; `backoff` decides how long it
//! waits between attempts.

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff, BackoffPolicy};
