//! In-memory implementation of WorkflowEventStore for testing

use async_trait::async_trait;
use parking_lot::RwLock;

use super::ledger::Ledger;
use super::store::*;
use crate::workflow::{Event, NewEvent};

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing. It keeps everything in memory and
/// provides the same append semantics as the file store.
///
/// # Example
///
/// ```
/// use keel_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    ledger: RwLock<Ledger>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            ledger: RwLock::new(Ledger::default()),
        }
    }

    /// Get the number of executions
    pub fn execution_count(&self) -> usize {
        self.ledger.read().len()
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write();
        ledger.check_create(&execution)?;
        ledger.insert(execution, Vec::new());
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<WorkflowExecution, StoreError> {
        self.ledger.read().get(id).cloned()
    }

    async fn latest_run(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.ledger.read().latest_run(workflow_id).cloned())
    }

    async fn list_executions(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self.ledger.read().list(status))
    }

    async fn update_execution(
        &self,
        id: &ExecutionId,
        update: ExecutionUpdate,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write();
        let mut execution = ledger.get(id)?.clone();
        execution.apply(update);
        ledger.replace(execution)
    }

    async fn append_event(
        &self,
        id: &ExecutionId,
        expected_sequence: u64,
        event: NewEvent,
    ) -> Result<u64, StoreError> {
        let mut ledger = self.ledger.write();
        let event = ledger.check_append(id, expected_sequence, event)?;
        ledger.commit_append(id, event)
    }

    async fn load_events(&self, id: &ExecutionId) -> Result<Vec<Event>, StoreError> {
        Ok(self.ledger.read().events(id)?.to_vec())
    }

    async fn next_sequence(&self, id: &ExecutionId) -> Result<u64, StoreError> {
        Ok(self.ledger.read().events(id)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Failure;
    use crate::workflow::EventKind;
    use serde_json::json;

    fn execution(workflow_id: &str) -> WorkflowExecution {
        WorkflowExecution::new(
            ExecutionId::new_run(workflow_id),
            "greeting_workflow",
            "default",
            json!("World"),
        )
    }

    fn started() -> NewEvent {
        NewEvent::new(EventKind::WorkflowStarted {
            workflow_type: "greeting_workflow".into(),
            task_queue: "default".into(),
            input: json!("World"),
            parent: None,
        })
    }

    #[tokio::test]
    async fn test_create_and_get_execution() {
        let store = InMemoryWorkflowEventStore::new();
        let execution = execution("wf-1");
        let id = execution.id.clone();

        store.create_execution(execution.clone()).await.unwrap();

        let loaded = store.get_execution(&id).await.unwrap();
        assert_eq!(loaded, execution);
        assert_eq!(loaded.status, WorkflowStatus::NotStarted);
        assert_eq!(store.execution_count(), 1);

        let again = store.create_execution(execution).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_get_missing_execution() {
        let store = InMemoryWorkflowEventStore::new();
        let result = store.get_execution(&ExecutionId::new_run("nope")).await;
        assert!(matches!(result, Err(StoreError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let store = InMemoryWorkflowEventStore::new();
        let execution = execution("wf-1");
        let id = execution.id.clone();
        store.create_execution(execution).await.unwrap();

        let seq = store.append_event(&id, 0, started()).await.unwrap();
        assert_eq!(seq, 0);

        let seq = store
            .append_event(
                &id,
                1,
                NewEvent::new(EventKind::WorkflowCompleted {
                    result: json!("Hello, World!"),
                }),
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let events = store.load_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].event_id, "workflow-closed");
        assert_eq!(store.next_sequence(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sequence_conflict_leaves_log_unchanged() {
        let store = InMemoryWorkflowEventStore::new();
        let execution = execution("wf-1");
        let id = execution.id.clone();
        store.create_execution(execution).await.unwrap();
        store.append_event(&id, 0, started()).await.unwrap();

        let result = store
            .append_event(
                &id,
                0,
                NewEvent::new(EventKind::WorkflowCancelRequested {
                    reason: "late".into(),
                }),
            )
            .await;

        assert!(matches!(
            result,
            Err(StoreError::Conflict(ConflictError::SequenceMismatch {
                expected: 0,
                actual: 1
            }))
        ));
        assert_eq!(store.load_events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let store = InMemoryWorkflowEventStore::new();
        let execution = execution("wf-1");
        let id = execution.id.clone();
        store.create_execution(execution).await.unwrap();
        store.append_event(&id, 0, started()).await.unwrap();
        store
            .append_event(
                &id,
                1,
                NewEvent::new(EventKind::WorkflowCompleted { result: json!(1) }),
            )
            .await
            .unwrap();

        let result = store
            .append_event(
                &id,
                2,
                NewEvent::new(EventKind::WorkflowFailed {
                    failure: Failure::application("second close"),
                }),
            )
            .await;

        assert!(result.as_ref().is_err_and(|e| e.is_duplicate_event()));
        let events = store.load_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].kind,
            EventKind::WorkflowCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_latest_run_and_list() {
        let store = InMemoryWorkflowEventStore::new();
        let first = execution("wf-1");
        let second = execution("wf-1");
        let other = execution("wf-2");
        store.create_execution(first).await.unwrap();
        store.create_execution(second.clone()).await.unwrap();
        store.create_execution(other.clone()).await.unwrap();

        let latest = store.latest_run("wf-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(store.latest_run("missing").await.unwrap().is_none());

        store
            .update_execution(&other.id, ExecutionUpdate::status(WorkflowStatus::Running))
            .await
            .unwrap();
        let running = store
            .list_executions(Some(WorkflowStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, other.id);
        assert_eq!(store.list_executions(None).await.unwrap().len(), 3);
    }
}
