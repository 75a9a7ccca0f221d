//! Typed failure taxonomy
//!
//! Every failure that crosses the engine is a [`Failure`]: a message, a
//! [`FailureKind`] and an optional boxed cause. Leaves carry the error that
//! actually happened, wrappers record which boundary it crossed.
//!
//! - [`Failure`] - The failure value stored in events and delivered to workflow code
//! - [`classify`] - Turns an activity's raised error into a leaf failure
//! - [`wrap_across_boundary`] - Adds exactly one wrapper per boundary crossing

mod classify;
mod types;

pub use classify::{classify, is_retryable, wrap_across_boundary, Boundary};
pub use types::{Failure, FailureKind, RetryState, TimeoutType};
