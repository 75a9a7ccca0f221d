//! Classification of raised errors and wrapping at boundaries

use uuid::Uuid;

use super::{Failure, FailureKind, RetryState};
use crate::activity::ActivityError;

/// A boundary a failure crosses on its way to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Boundary {
    /// From an activity into the workflow that scheduled it
    Activity {
        activity_id: String,
        activity_type: String,
        attempt: u32,
        retry_state: RetryState,
    },
    /// From a child workflow into its parent
    ChildWorkflow {
        workflow_id: String,
        run_id: Uuid,
        workflow_type: String,
    },
}

/// Classify an error raised by an activity into a leaf failure
///
/// Message, error type, details and the non-retryable marker are preserved.
pub fn classify(error: &ActivityError) -> Failure {
    let mut failure = if error.non_retryable {
        Failure::non_retryable(error.message.clone())
    } else {
        Failure::application(error.message.clone())
    };
    if let Some(error_type) = &error.error_type {
        failure = failure.with_error_type(error_type.clone());
    }
    if let Some(details) = &error.details {
        failure = failure.with_details(details.clone());
    }
    failure
}

impl From<ActivityError> for Failure {
    fn from(error: ActivityError) -> Self {
        classify(&error)
    }
}

/// Whether a failed attempt may be retried at all
///
/// Non-retryable application failures, application failures whose type is
/// listed in `non_retryable_error_types`, and cancellations are final.
/// Everything else, timeouts included, is transient.
pub fn is_retryable(failure: &Failure, non_retryable_error_types: &[String]) -> bool {
    match failure.kind() {
        FailureKind::Application {
            non_retryable: true,
            ..
        } => false,
        FailureKind::Application {
            error_type: Some(error_type),
            ..
        } => !non_retryable_error_types.iter().any(|t| t == error_type),
        FailureKind::Cancelled => false,
        _ => true,
    }
}

/// Wrap a failure once for the boundary it is crossing
pub fn wrap_across_boundary(failure: Failure, boundary: Boundary) -> Failure {
    match boundary {
        Boundary::Activity {
            activity_id,
            activity_type,
            attempt,
            retry_state,
        } => Failure::wrapper(
            "activity task failed",
            FailureKind::Activity {
                activity_id,
                activity_type,
                attempt,
                retry_state,
            },
            failure,
        ),
        Boundary::ChildWorkflow {
            workflow_id,
            run_id,
            workflow_type,
        } => Failure::wrapper(
            "child workflow execution failed",
            FailureKind::ChildWorkflow {
                workflow_id,
                run_id,
                workflow_type,
            },
            failure,
        ),
    }
}
