//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::workflow::ActivityOptions;

/// What an activity raises instead of returning a value
///
/// [`classify`](crate::failure::classify) turns it into an `ApplicationFailure`
/// leaf, which the engine then wraps in an `ActivityFailure` carrying the
/// attempt and retry state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Becomes the failure message, and the root cause text callers see
    pub message: String,

    /// Compared with `non_retryable_error_types` of the retry policy
    pub error_type: Option<String>,

    /// Ends the activity after this attempt whatever the policy says
    pub non_retryable: bool,

    /// Copied verbatim into the failure
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// An error the retry policy decides about
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            non_retryable: false,
            details: None,
        }
    }

    /// An error that classifies as a non-retryable application failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            non_retryable: true,
            details: None,
        }
    }

    /// Tag the error so a policy can list it as non-retryable
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

/// Retryable, with the whole context chain folded into the message
impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", err))
    }
}

/// An activity is a unit of work that may fail and be retried
///
/// Activities run on workers outside the workflow, so they may do I/O and
/// take a long time. Each attempt gets a fresh [`ActivityContext`].
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// struct ComposeGreeting;
///
/// #[async_trait]
/// impl Activity for ComposeGreeting {
///     const TYPE: &'static str = "compose_greeting";
///     type Input = ComposeGreetingInput;
///     type Output = String;
///
///     async fn execute(
///         &self,
///         _ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         Ok(format!("{}, {}!", input.greeting, input.name))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier, used to look up the activity in the registry
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Options used when a workflow schedules this activity without its own
    fn options(&self) -> ActivityOptions {
        ActivityOptions::default()
    }

    /// Execute one attempt
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_retryable() {
        let error = ActivityError::retryable("timeout");
        assert!(!error.non_retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_activity_error_non_retryable() {
        let error = ActivityError::non_retryable("invalid input");
        assert!(error.non_retryable);
    }

    #[test]
    fn test_activity_error_with_type() {
        let error = ActivityError::retryable("connection failed").with_type("CONNECTION_ERROR");

        assert_eq!(error.error_type, Some("CONNECTION_ERROR".to_string()));
    }

    #[test]
    fn test_from_anyhow_is_retryable() {
        let error: ActivityError = anyhow::anyhow!("disk full").into();
        assert!(!error.non_retryable);
        assert_eq!(error.message, "disk full");
    }

    #[test]
    fn test_anyhow_context_lands_in_failure_message() {
        use anyhow::Context;

        let error: ActivityError = Err::<(), _>(anyhow::anyhow!("disk full"))
            .context("writing greeting")
            .unwrap_err()
            .into();
        let error = error.with_details(serde_json::json!({"path": "/tmp"}));
        let failure = crate::failure::classify(&error);

        assert_eq!(failure.message(), "writing greeting: disk full");
        assert!(!failure.is_non_retryable());
        assert_eq!(failure.details(), Some(&serde_json::json!({"path": "/tmp"})));
    }
}
