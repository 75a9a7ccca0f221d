//! Failure value types

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which activity deadline elapsed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// The task waited in its queue longer than `schedule_to_start_timeout`
    ScheduleToStart,
    /// A single attempt ran longer than `start_to_close_timeout`
    StartToClose,
}

impl fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutType::ScheduleToStart => write!(f, "ScheduleToStart"),
            TimeoutType::StartToClose => write!(f, "StartToClose"),
        }
    }
}

/// Why the engine stopped retrying an activity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    /// The last failure was classified as non-retryable
    NonRetryableFailure,
    /// The retry policy ran out of attempts
    MaximumAttemptsReached,
    /// The workflow was cancelled while the activity was outstanding
    Cancelled,
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryState::NonRetryableFailure => write!(f, "NonRetryableFailure"),
            RetryState::MaximumAttemptsReached => write!(f, "MaximumAttemptsReached"),
            RetryState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// What a [`Failure`] describes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    // =========================================================================
    // Leaves
    // =========================================================================
    /// An error raised by user code
    Application {
        /// Application-defined error type, matched against
        /// `RetryPolicy::non_retryable_error_types`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_type: Option<String>,

        /// Raised with an explicit "do not retry" marker
        #[serde(default)]
        non_retryable: bool,

        /// Structured details attached by the raiser
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    /// An activity deadline elapsed
    Timeout {
        /// Which deadline
        timeout_type: TimeoutType,
    },

    /// Work was cancelled before it finished
    Cancelled,

    // =========================================================================
    // Wrappers
    // =========================================================================
    /// The cause escaped an activity
    Activity {
        /// Activity ID within the workflow
        activity_id: String,
        /// Registered activity type
        activity_type: String,
        /// Attempt that produced the final failure
        attempt: u32,
        /// Why retries stopped
        retry_state: RetryState,
    },

    /// The cause escaped a child workflow
    ChildWorkflow {
        /// Child workflow ID
        workflow_id: String,
        /// Child run ID
        run_id: Uuid,
        /// Child workflow type
        workflow_type: String,
    },
}

impl FailureKind {
    /// Wrappers record a boundary crossing and always carry a cause
    pub fn is_wrapper(&self) -> bool {
        matches!(
            self,
            FailureKind::Activity { .. } | FailureKind::ChildWorkflow { .. }
        )
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::Application { .. } => "ApplicationFailure",
            FailureKind::Timeout { .. } => "TimeoutFailure",
            FailureKind::Cancelled => "CancelledFailure",
            FailureKind::Activity { .. } => "ActivityFailure",
            FailureKind::ChildWorkflow { .. } => "ChildWorkflowFailure",
        }
    }
}

/// A failure with its cause chain
///
/// Leaves (application, timeout, cancelled) never have a cause, wrappers
/// (activity, child workflow) always do. The chain is owned through `Box`,
/// so it is acyclic and always ends in a leaf. Deserialization enforces the
/// same shape.
///
/// # Example
///
/// ```
/// use keel_durable::failure::Failure;
///
/// let failure = Failure::application("Exception from activity")
///     .with_error_type("ValueError");
///
/// assert!(!failure.is_non_retryable());
/// assert_eq!(failure.error_type(), Some("ValueError"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "FailureRecord", into = "FailureRecord")]
pub struct Failure {
    message: String,
    kind: FailureKind,
    cause: Option<Box<Failure>>,
}

impl Failure {
    /// A retryable application failure
    pub fn application(message: impl Into<String>) -> Self {
        Self::leaf(
            message,
            FailureKind::Application {
                error_type: None,
                non_retryable: false,
                details: None,
            },
        )
    }

    /// An application failure that must never be retried
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::leaf(
            message,
            FailureKind::Application {
                error_type: None,
                non_retryable: true,
                details: None,
            },
        )
    }

    /// A timeout failure
    pub fn timeout(timeout_type: TimeoutType) -> Self {
        Self::leaf(
            format!("activity {} timeout", timeout_type),
            FailureKind::Timeout { timeout_type },
        )
    }

    /// A cancellation
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::leaf(reason, FailureKind::Cancelled)
    }

    fn leaf(message: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            message: message.into(),
            kind,
            cause: None,
        }
    }

    pub(crate) fn wrapper(message: impl Into<String>, kind: FailureKind, cause: Failure) -> Self {
        Self {
            message: message.into(),
            kind,
            cause: Some(Box::new(cause)),
        }
    }

    /// Set the application error type (no effect on other kinds)
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        if let FailureKind::Application {
            error_type: slot, ..
        } = &mut self.kind
        {
            *slot = Some(error_type.into());
        }
        self
    }

    /// Attach application details (no effect on other kinds)
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let FailureKind::Application { details: slot, .. } = &mut self.kind {
            *slot = Some(details);
        }
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    /// The wrapped failure, if this is a wrapper
    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }

    /// This failure followed by each cause in turn
    pub fn chain(&self) -> impl Iterator<Item = &Failure> {
        std::iter::successors(Some(self), |failure| failure.cause())
    }

    /// The leaf at the end of the chain
    pub fn root_cause(&self) -> &Failure {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }

    /// Application error type of this failure, if it is an application failure
    pub fn error_type(&self) -> Option<&str> {
        match &self.kind {
            FailureKind::Application { error_type, .. } => error_type.as_deref(),
            _ => None,
        }
    }

    /// Application details of this failure, if any
    pub fn details(&self) -> Option<&serde_json::Value> {
        match &self.kind {
            FailureKind::Application { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    /// True for application failures raised with the non-retryable marker
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Application {
                non_retryable: true,
                ..
            }
        )
    }

    pub fn is_application(&self) -> bool {
        matches!(self.kind, FailureKind::Application { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout { .. })
    }

    /// True when the chain ends in a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause().kind, FailureKind::Cancelled)
    }
}

impl fmt::Display for Failure {
    /// `{}` prints this failure's message, `{:#}` prints the whole chain.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if f.alternate() {
            for cause in self.chain().skip(1) {
                write!(f, ": {}", cause.message)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Wire shape of [`Failure`]
#[derive(Serialize, Deserialize)]
struct FailureRecord {
    message: String,
    kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<Box<Failure>>,
}

impl TryFrom<FailureRecord> for Failure {
    type Error = String;

    fn try_from(record: FailureRecord) -> Result<Self, Self::Error> {
        match (record.kind.is_wrapper(), record.cause.is_some()) {
            (true, false) => Err(format!(
                "{} must carry a cause",
                record.kind.name()
            )),
            (false, true) => Err(format!(
                "{} cannot carry a cause",
                record.kind.name()
            )),
            _ => Ok(Self {
                message: record.message,
                kind: record.kind,
                cause: record.cause,
            }),
        }
    }
}

impl From<Failure> for FailureRecord {
    fn from(failure: Failure) -> Self {
        Self {
            message: failure.message,
            kind: failure.kind,
            cause: failure.cause,
        }
    }
}
