//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff or an explicit schedule
//! - [`should_retry`] - Turns a failed attempt into a [`RetryDecision`]

mod retry;

pub use retry::{should_retry, RetryDecision, RetryPolicy};
