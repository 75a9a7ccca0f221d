//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::{WorkflowAction, WorkflowContext};
use crate::failure::Failure;

/// What a workflow handler returns
///
/// `Ok(actions)` issues commands. `Err(failure)` means the failure escaped
/// workflow code and fails the execution with it.
pub type WorkflowStep = Result<Vec<WorkflowAction>, Failure>;

/// A workflow is a deterministic state machine driven by events
///
/// The engine rebuilds a workflow by calling [`Workflow::new`] and replaying
/// its whole history through the handlers below, then appends whatever
/// commands the code issued that are not in the history yet.
///
/// # Determinism
///
/// Given the same history, a workflow must issue the same commands. Read
/// time and randomness only through the [`WorkflowContext`] and keep all
/// I/O inside activities.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// struct GreetingWorkflow {
///     name: String,
/// }
///
/// impl Workflow for GreetingWorkflow {
///     const TYPE: &'static str = "greeting_workflow";
///     type Input = String;
///     type Output = String;
///
///     fn new(name: Self::Input) -> Self {
///         Self { name }
///     }
///
///     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
///         Ok(vec![WorkflowAction::schedule_activity(
///             "compose",
///             "compose_greeting",
///             json!({ "greeting": "Hello", "name": self.name }),
///         )])
///     }
///
///     fn on_activity_resolved(
///         &mut self,
///         _ctx: &mut WorkflowContext,
///         _activity_id: &str,
///         result: Result<serde_json::Value, Failure>,
///     ) -> WorkflowStep {
///         Ok(vec![WorkflowAction::complete(result?)])
///     }
/// }
/// ```
pub trait Workflow: Send + 'static {
    /// Unique type identifier, used to look up the workflow during replay
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a workflow instance from input
    ///
    /// Called on every tick, before the history is replayed.
    fn new(input: Self::Input) -> Self;

    /// Called once, for the `WorkflowStarted` event
    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowStep;

    /// Called when an activity resolves
    ///
    /// A failure arrives wrapped as an activity failure, after retries are
    /// exhausted or a non-retryable error was raised.
    fn on_activity_resolved(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Result<serde_json::Value, Failure>,
    ) -> WorkflowStep;

    /// Called when a child workflow closes
    ///
    /// The default ignores results and lets failures escape.
    fn on_child_resolved(
        &mut self,
        ctx: &mut WorkflowContext,
        child_key: &str,
        result: Result<serde_json::Value, Failure>,
    ) -> WorkflowStep {
        let _ = (ctx, child_key);
        result.map(|_| vec![])
    }

    /// Called after cancellation resolved every outstanding wait
    ///
    /// The default fails the workflow with a cancellation.
    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str) -> WorkflowStep {
        let _ = ctx;
        Err(Failure::cancelled(reason))
    }
}

/// Decode a JSON payload delivered to workflow code
///
/// A payload that does not match `T` is a non-retryable failure.
pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, Failure> {
    serde_json::from_value(value).map_err(|e| {
        Failure::non_retryable(format!("failed to decode payload: {}", e))
            .with_error_type("PayloadDecode")
    })
}

/// Encode a value for a command or a workflow result
pub fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, Failure> {
    serde_json::to_value(value).map_err(|e| {
        Failure::non_retryable(format!("failed to encode payload: {}", e))
            .with_error_type("PayloadEncode")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Greeting {
        greeting: String,
    }

    #[test]
    fn test_decode() {
        let greeting: Greeting = decode(json!({"greeting": "Hello"})).unwrap();
        assert_eq!(greeting.greeting, "Hello");
    }

    #[test]
    fn test_decode_mismatch_is_non_retryable() {
        let failure = decode::<Greeting>(json!(42)).unwrap_err();
        assert!(failure.is_non_retryable());
        assert_eq!(failure.error_type(), Some("PayloadDecode"));
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(&vec![1, 2]).unwrap(), json!([1, 2]));
    }
}
