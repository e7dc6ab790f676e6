//! Resilience helpers.
//!
//! # Design Decisions
//! - Listener binds are retried with exponential backoff plus jitter, so a port still
//!   held by a draining generation does not fail a reconfiguration outright

pub mod backoff;

pub use backoff::{calculate_backoff, RetryPolicy};
