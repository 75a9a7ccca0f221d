//! Parent/child workflow linkage
//!
//! A child run is created after its parent's tick has recorded
//! `ChildWorkflowStarted`. When the child closes, its outcome is appended
//! to the parent's history as `ChildWorkflowCompleted` or
//! `ChildWorkflowFailed`. Both events carry deterministic ids, so a repeated
//! start or a repeated notification is harmless.

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::core::{Engine, EngineError, NewRun};
use crate::failure::Failure;
use crate::persistence::{ExecutionId, ParentLink, WorkflowStatus};
use crate::workflow::{ChildWorkflowOptions, EventKind, NewEvent};

/// Identity of a child run
///
/// The workflow id defaults to `<parent workflow id>/<child key>`. The run
/// id is derived from the parent run and the child key, so replaying the
/// parent always names the same child.
pub fn child_execution_id(
    parent: &ExecutionId,
    child_key: &str,
    options: &ChildWorkflowOptions,
) -> ExecutionId {
    let workflow_id = options
        .workflow_id
        .clone()
        .unwrap_or_else(|| format!("{}/{}", parent.workflow_id, child_key));
    ExecutionId::new(
        workflow_id,
        Uuid::new_v5(&parent.run_id, child_key.as_bytes()),
    )
}

/// A child as recorded by its parent's `ChildWorkflowStarted` event
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStart {
    pub child_key: String,
    pub execution: ExecutionId,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
}

/// Starts children and reports their outcome to the parent
pub struct ChildWorkflowCoordinator<'a> {
    engine: &'a Engine,
}

impl<'a> ChildWorkflowCoordinator<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Create the child run, or return the one that already exists
    ///
    /// A child that already closed is reported to the parent again. When
    /// the child's workflow id has an open run of its own, the parent gets a
    /// non-retryable `WorkflowExecutionAlreadyStarted` failure for the child.
    #[instrument(skip(self, child), fields(child = %child.execution, child_key = %child.child_key))]
    pub async fn start_child(
        &self,
        parent: &ExecutionId,
        child: ChildStart,
    ) -> Result<ExecutionId, EngineError> {
        let id = child.execution.clone();
        let run = NewRun {
            id: id.clone(),
            workflow_type: child.workflow_type,
            task_queue: child.task_queue,
            input: child.input,
            parent: Some(ParentLink {
                execution: parent.clone(),
                child_key: child.child_key.clone(),
            }),
        };

        match self.engine.create_run(run).await {
            Ok(true) => info!("child workflow started"),
            Ok(false) => {
                let existing = self.engine.store().get_execution(&id).await?;
                if existing.status.is_terminal() {
                    self.on_child_closed(&id).await?;
                }
            }
            Err(EngineError::AlreadyStarted(workflow_id)) => {
                warn!(%workflow_id, "child workflow id is already in use");
                let failure = Failure::non_retryable(format!(
                    "workflow {} already has a running execution",
                    workflow_id
                ))
                .with_error_type("WorkflowExecutionAlreadyStarted");
                self.deliver(
                    parent,
                    EventKind::ChildWorkflowFailed {
                        child_key: child.child_key,
                        failure,
                    },
                )
                .await?;
            }
            Err(e) => return Err(e),
        }

        Ok(id)
    }

    /// Append a closed child's outcome to its parent
    ///
    /// The failure is stored as the child left it; the parent wraps it once
    /// when the event is delivered to workflow code.
    #[instrument(skip(self))]
    pub async fn on_child_closed(&self, child: &ExecutionId) -> Result<(), EngineError> {
        let execution = self.engine.store().get_execution(child).await?;
        let Some(link) = execution.parent else {
            return Ok(());
        };

        let kind = match execution.status {
            WorkflowStatus::Completed => EventKind::ChildWorkflowCompleted {
                child_key: link.child_key,
                result: execution.result.unwrap_or(Value::Null),
            },
            WorkflowStatus::Failed | WorkflowStatus::Terminated => EventKind::ChildWorkflowFailed {
                child_key: link.child_key,
                failure: execution
                    .failure
                    .unwrap_or_else(|| Failure::cancelled("child workflow closed")),
            },
            WorkflowStatus::NotStarted | WorkflowStatus::Running => return Ok(()),
        };

        self.deliver(&link.execution, kind).await
    }

    async fn deliver(&self, parent: &ExecutionId, kind: EventKind) -> Result<(), EngineError> {
        let execution = {
            let _tick = self.engine.lock(parent).await;
            let execution = self.engine.store().get_execution(parent).await?;
            if execution.status.is_terminal() {
                debug!(%parent, "parent already closed, dropping child outcome");
                return Ok(());
            }
            let next = self.engine.store().next_sequence(parent).await?;
            match self
                .engine
                .store()
                .append_event(parent, next, NewEvent::new(kind))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_duplicate_event() => {
                    debug!(%parent, "child outcome already delivered");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            execution
        };

        self.engine.queue_tick(&execution);
        Ok(())
    }
}
