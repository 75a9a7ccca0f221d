//! Deterministic context handed to workflow code

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persistence::ExecutionId;

/// Deterministic view of the world for workflow handlers
///
/// Everything here is derived from the history being replayed, so a
/// handler sees the same values every time its event is applied.
#[derive(Debug)]
pub struct WorkflowContext {
    execution: ExecutionId,
    workflow_type: String,
    now: DateTime<Utc>,
    replaying: bool,
    counter: u64,
}

impl WorkflowContext {
    pub(crate) fn new(execution: ExecutionId, workflow_type: impl Into<String>) -> Self {
        Self {
            execution,
            workflow_type: workflow_type.into(),
            now: DateTime::<Utc>::UNIX_EPOCH,
            replaying: false,
            counter: 0,
        }
    }

    /// Move the context to the event about to be applied
    pub(crate) fn advance(&mut self, timestamp: DateTime<Utc>, replaying: bool) {
        self.now = timestamp;
        self.replaying = replaying;
    }

    pub fn workflow_id(&self) -> &str {
        &self.execution.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.execution.run_id
    }

    pub fn execution(&self) -> &ExecutionId {
        &self.execution
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Timestamp of the event being applied
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True while applying events a previous tick already applied
    ///
    /// Use it to keep side-effect-free logging from repeating on replay.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Random number seeded from the run ID and a call counter
    pub fn random_u64(&mut self) -> u64 {
        let bytes = self.next_seed().into_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(head)
    }

    /// UUID seeded from the run ID and a call counter
    pub fn new_uuid(&mut self) -> Uuid {
        self.next_seed()
    }

    fn next_seed(&mut self) -> Uuid {
        self.counter += 1;
        Uuid::new_v5(&self.execution.run_id, &self.counter.to_le_bytes())
    }
}
