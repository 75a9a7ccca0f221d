//! WorkflowEventStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::failure::Failure;
use crate::workflow::{Event, NewEvent};

/// Rejected append
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictError {
    /// Another append won the race for this slot
    #[error("sequence mismatch: expected {expected}, log is at {actual}")]
    SequenceMismatch { expected: u64, actual: u64 },

    /// An event with this id is already in the log
    #[error("duplicate event: {event_id}")]
    DuplicateEvent { event_id: String },
}

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// Execution already exists
    #[error("execution already exists: {0}")]
    AlreadyExists(ExecutionId),

    /// Optimistic append failed
    #[error("append conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted data is unreadable
    #[error("corrupted store: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// True when the append was rejected because the event id is already logged
    pub fn is_duplicate_event(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict(ConflictError::DuplicateEvent { .. })
        )
    }
}

/// Identity of one run of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId {
    /// Caller-chosen workflow ID, shared by every run
    pub workflow_id: String,

    /// Engine-assigned run ID
    pub run_id: Uuid,
}

impl ExecutionId {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }

    /// New top-level run with a time-ordered run ID
    pub fn new_run(workflow_id: impl Into<String>) -> Self {
        Self::new(workflow_id, Uuid::now_v7())
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Execution record created, history not started yet
    NotStarted,

    /// Workflow is running
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was terminated or cancelled
    Terminated,
}

impl WorkflowStatus {
    /// Terminal statuses are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Link from a child execution to the parent that started it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// The parent run
    pub execution: ExecutionId,

    /// Key the parent used for this child
    pub child_key: String,
}

/// Persisted execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Last event sequence applied by a completed tick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_cursor: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// A fresh record in `NotStarted`
    pub fn new(
        id: ExecutionId,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id,
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input,
            status: WorkflowStatus::NotStarted,
            parent: None,
            result: None,
            failure: None,
            replay_cursor: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Apply an update in place
    pub fn apply(&mut self, update: ExecutionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.failure.is_some() {
            self.failure = update.failure;
        }
        if update.replay_cursor.is_some() {
            self.replay_cursor = update.replay_cursor;
        }
        if update.closed_at.is_some() {
            self.closed_at = update.closed_at;
        }
    }
}

/// Partial update of an execution record; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub status: Option<WorkflowStatus>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<Failure>,
    pub replay_cursor: Option<u64>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ExecutionUpdate {
    pub fn status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn cursor(sequence: u64) -> Self {
        Self {
            replay_cursor: Some(sequence),
            ..Default::default()
        }
    }

    /// Close the run with a terminal status
    pub fn closed(
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        failure: Option<Failure>,
    ) -> Self {
        Self {
            status: Some(status),
            result,
            failure,
            replay_cursor: None,
            closed_at: Some(Utc::now()),
        }
    }

    pub fn with_cursor(mut self, sequence: u64) -> Self {
        self.replay_cursor = Some(sequence);
        self
    }
}

/// Durable storage for execution records and their event histories
///
/// Histories are append-only. Each append names the sequence number it
/// expects to occupy, and every event carries an id that is unique within
/// its execution, so a lost race or a duplicate delivery is rejected without
/// touching the log.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Executions
    // =========================================================================

    /// Create an execution record
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the run id is taken.
    async fn create_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError>;

    /// Get an execution record
    async fn get_execution(&self, id: &ExecutionId) -> Result<WorkflowExecution, StoreError>;

    /// Most recently created run for a workflow id
    async fn latest_run(&self, workflow_id: &str)
        -> Result<Option<WorkflowExecution>, StoreError>;

    /// List executions, optionally filtered by status
    async fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Update status, result, failure or replay cursor
    async fn update_execution(
        &self,
        id: &ExecutionId,
        update: ExecutionUpdate,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Append an event at `expected_sequence`, returning its sequence number
    ///
    /// Fails with [`ConflictError::SequenceMismatch`] when the log has moved
    /// on and [`ConflictError::DuplicateEvent`] when the event id is already
    /// present. A rejected append leaves the log unchanged.
    async fn append_event(
        &self,
        id: &ExecutionId,
        expected_sequence: u64,
        event: NewEvent,
    ) -> Result<u64, StoreError>;

    /// Full ordered history
    async fn load_events(&self, id: &ExecutionId) -> Result<Vec<Event>, StoreError>;

    /// Sequence number the next append must use
    async fn next_sequence(&self, id: &ExecutionId) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!WorkflowStatus::NotStarted.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Terminated.is_terminal());
    }

    #[test]
    fn test_execution_id_display() {
        let id = ExecutionId::new("greeting", Uuid::nil());
        assert_eq!(
            id.to_string(),
            "greeting/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_apply_update_keeps_untouched_fields() {
        let mut execution = WorkflowExecution::new(
            ExecutionId::new_run("wf"),
            "greeting",
            "queue",
            serde_json::json!("World"),
        );
        execution.apply(ExecutionUpdate::status(WorkflowStatus::Running).with_cursor(3));
        assert_eq!(execution.status, WorkflowStatus::Running);
        assert_eq!(execution.replay_cursor, Some(3));

        execution.apply(ExecutionUpdate::closed(
            WorkflowStatus::Completed,
            Some(serde_json::json!("done")),
            None,
        ));
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.replay_cursor, Some(3));
        assert!(execution.closed_at.is_some());
    }
}
