//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ActivityOptions;
use crate::failure::Failure;
use crate::persistence::ParentLink;
use crate::reliability::RetryDecision;

/// One entry of an execution's history
///
/// Events are immutable once written. The workflow state is reconstructed
/// by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Position in the history, starting at 0
    pub sequence: u64,

    /// Deterministic key, unique within the execution
    pub event_id: String,

    /// When the event was appended
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub kind: EventKind,
}

/// An event that has not been assigned a sequence number yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl NewEvent {
    /// Stamp an event with its deterministic id and the current time
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: kind.event_id(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Attach the sequence number the store assigned
    pub fn into_event(self, sequence: u64) -> Event {
        Event {
            sequence,
            event_id: self.event_id,
            timestamp: self.timestamp,
            kind: self.kind,
        }
    }
}

/// What an event records
///
/// Command events (`ActivityScheduled`, `ChildWorkflowStarted`,
/// `WorkflowCompleted`, `WorkflowFailed`) are produced by workflow code and
/// must match what the code re-issues on replay. The others are inputs the
/// code reacts to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        workflow_type: String,
        task_queue: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },

    /// Workflow completed successfully
    WorkflowCompleted { result: serde_json::Value },

    /// Workflow failed; the failure is what the code raised
    WorkflowFailed { failure: Failure },

    /// Cancellation was requested from outside
    WorkflowCancelRequested { reason: String },

    /// Workflow was closed without running workflow code
    WorkflowTerminated { reason: String },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Resolved options; the retry policy is fixed from here on
        options: ActivityOptions,
    },

    /// An attempt succeeded
    ActivityCompleted {
        activity_id: String,
        attempt: u32,
        result: serde_json::Value,
    },

    /// An attempt failed
    ActivityFailed {
        activity_id: String,
        attempt: u32,

        /// Raw failure of this attempt, before any wrapping
        failure: Failure,

        /// What the retry policy decided for this failure
        decision: RetryDecision,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// A child workflow was started
    ChildWorkflowStarted {
        child_key: String,
        workflow_id: String,
        run_id: Uuid,
        workflow_type: String,
        task_queue: String,
        input: serde_json::Value,
    },

    /// A child workflow completed
    ChildWorkflowCompleted {
        child_key: String,
        result: serde_json::Value,
    },

    /// A child workflow closed with a failure
    ChildWorkflowFailed {
        child_key: String,

        /// The child's own terminal failure, before any wrapping
        failure: Failure,
    },
}

impl EventKind {
    /// Deterministic id of this event within its execution
    ///
    /// Closing events share one id, so an execution can close at most once,
    /// and so can each activity and child.
    pub fn event_id(&self) -> String {
        match self {
            EventKind::WorkflowStarted { .. } => "workflow-started".to_string(),
            EventKind::WorkflowCompleted { .. }
            | EventKind::WorkflowFailed { .. }
            | EventKind::WorkflowTerminated { .. } => "workflow-closed".to_string(),
            EventKind::WorkflowCancelRequested { .. } => "cancel-requested".to_string(),
            EventKind::ActivityScheduled { activity_id, .. } => {
                format!("activity-scheduled/{}", activity_id)
            }
            EventKind::ActivityCompleted { activity_id, .. } => {
                format!("activity-completed/{}", activity_id)
            }
            EventKind::ActivityFailed {
                activity_id,
                attempt,
                ..
            } => format!("activity-failed/{}/{}", activity_id, attempt),
            EventKind::ChildWorkflowStarted { child_key, .. } => {
                format!("child-started/{}", child_key)
            }
            EventKind::ChildWorkflowCompleted { child_key, .. }
            | EventKind::ChildWorkflowFailed { child_key, .. } => {
                format!("child-closed/{}", child_key)
            }
        }
    }

    /// Get the activity ID if this is an activity event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            EventKind::ActivityScheduled { activity_id, .. }
            | EventKind::ActivityCompleted { activity_id, .. }
            | EventKind::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Get the child key if this is a child workflow event
    pub fn child_key(&self) -> Option<&str> {
        match self {
            EventKind::ChildWorkflowStarted { child_key, .. }
            | EventKind::ChildWorkflowCompleted { child_key, .. }
            | EventKind::ChildWorkflowFailed { child_key, .. } => Some(child_key),
            _ => None,
        }
    }

    /// Check if this event closes the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowTerminated { .. }
        )
    }

    /// Check if this event records a command issued by workflow code
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            EventKind::ActivityScheduled { .. }
                | EventKind::ChildWorkflowStarted { .. }
                | EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::RetryState;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let kind = EventKind::ActivityScheduled {
            activity_id: "1".into(),
            activity_type: "compose_greeting".into(),
            input: json!({"greeting": "Hello", "name": "World"}),
            options: ActivityOptions::default(),
        };

        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "activity_scheduled");

        let parsed: EventKind = serde_json::from_value(json).unwrap();
        assert_eq!(kind, parsed);
    }

    #[test]
    fn test_event_ids_are_deterministic() {
        let failed = |attempt| EventKind::ActivityFailed {
            activity_id: "1".into(),
            attempt,
            failure: Failure::application("boom"),
            decision: RetryDecision::GiveUp {
                retry_state: RetryState::MaximumAttemptsReached,
            },
        };

        assert_eq!(failed(2).event_id(), "activity-failed/1/2");
        assert_ne!(failed(1).event_id(), failed(2).event_id());

        let completed = EventKind::WorkflowCompleted { result: json!(1) };
        let terminated = EventKind::WorkflowTerminated {
            reason: "stop".into(),
        };
        assert_eq!(completed.event_id(), terminated.event_id());
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = EventKind::ActivityCompleted {
            activity_id: "step-1".into(),
            attempt: 1,
            result: json!({}),
        };
        assert_eq!(event.activity_id(), Some("step-1"));

        let event = EventKind::WorkflowCancelRequested {
            reason: "user".into(),
        };
        assert_eq!(event.activity_id(), None);
    }

    #[test]
    fn test_is_terminal_and_command() {
        assert!(EventKind::WorkflowCompleted { result: json!(null) }.is_terminal());
        assert!(EventKind::WorkflowFailed {
            failure: Failure::application("x")
        }
        .is_terminal());
        assert!(!EventKind::WorkflowCancelRequested {
            reason: "x".into()
        }
        .is_terminal());

        assert!(EventKind::WorkflowCompleted { result: json!(null) }.is_command());
        assert!(!EventKind::WorkflowTerminated { reason: "x".into() }.is_command());
    }

    #[test]
    fn test_new_event_stamps_id() {
        let event = NewEvent::new(EventKind::ChildWorkflowCompleted {
            child_key: "child".into(),
            result: json!("ok"),
        });
        assert_eq!(event.event_id, "child-closed/child");
        assert_eq!(event.into_event(7).sequence, 7);
    }
}
