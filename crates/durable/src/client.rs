//! Submission API and execution handles
//!
//! The client talks to an [`Engine`] in the same process. Starting a
//! workflow only records it; a [`Worker`](crate::worker::Worker) polling the
//! task queue runs it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::{Engine, EngineError};
use crate::failure::Failure;
use crate::persistence::{ExecutionId, StoreError, WorkflowExecution, WorkflowStatus};
use crate::workflow::{Event, Workflow};

/// Task queue used when [`StartWorkflowOptions`] names none
pub const DEFAULT_TASK_QUEUE: &str = "default";

/// Options for starting a workflow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartWorkflowOptions {
    /// Workflow id; a fresh `<type>-<uuid>` id when unset
    pub id: Option<String>,

    /// Task queue; [`DEFAULT_TASK_QUEUE`] when unset
    pub task_queue: Option<String>,
}

impl StartWorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

/// A workflow run that closed with a failure
///
/// `cause` is the failure the run ended with, wrappers included. For a run
/// that was cancelled or terminated its root cause is a cancellation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("workflow {workflow_type} ({execution}) failed: {cause:#}")]
pub struct WorkflowFailureError {
    pub execution: ExecutionId,
    pub workflow_type: String,
    #[source]
    pub cause: Failure,
}

impl WorkflowFailureError {
    /// Innermost failure of the chain
    pub fn root_cause(&self) -> &Failure {
        self.cause.root_cause()
    }
}

/// Errors returned to client callers
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The workflow id already has an open run
    #[error("workflow {0} already has a running execution")]
    AlreadyStarted(String),

    /// No such workflow or run
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// The run closed with a failure
    #[error(transparent)]
    WorkflowFailed(#[from] WorkflowFailureError),

    /// Other engine error
    #[error(transparent)]
    Engine(EngineError),

    /// Input or result did not match the workflow's types
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<EngineError> for ClientError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::AlreadyStarted(workflow_id) => Self::AlreadyStarted(workflow_id),
            EngineError::WorkflowNotFound(workflow_id) => Self::NotFound(workflow_id),
            EngineError::Store(StoreError::ExecutionNotFound(id)) => Self::NotFound(id.to_string()),
            other => Self::Engine(other),
        }
    }
}

/// Client for starting and observing workflows
///
/// # Example
///
/// ```ignore
/// let client = Client::new(engine.clone());
///
/// let greeting: String = client
///     .execute_workflow::<GreetingWorkflow>("World".into(), StartWorkflowOptions::new())
///     .await?;
/// ```
#[derive(Clone)]
pub struct Client {
    engine: Arc<Engine>,
}

impl Client {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start a workflow and return a handle to its run
    #[instrument(skip(self, input, options), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(
        &self,
        input: W::Input,
        options: StartWorkflowOptions,
    ) -> Result<WorkflowHandle<W::Output>, ClientError> {
        let input = serde_json::to_value(&input)?;
        let workflow_id = options
            .id
            .unwrap_or_else(|| format!("{}-{}", W::TYPE, Uuid::now_v7()));
        let task_queue = options
            .task_queue
            .unwrap_or_else(|| DEFAULT_TASK_QUEUE.to_string());

        let execution = self
            .engine
            .start_workflow(&workflow_id, W::TYPE, &task_queue, input)
            .await?;
        info!(%execution, %task_queue, "workflow submitted");

        Ok(WorkflowHandle::new(
            Arc::clone(&self.engine),
            execution,
            W::TYPE.to_string(),
        ))
    }

    /// Start a workflow and wait for its result
    pub async fn execute_workflow<W: Workflow>(
        &self,
        input: W::Input,
        options: StartWorkflowOptions,
    ) -> Result<W::Output, ClientError> {
        self.start_workflow::<W>(input, options)
            .await?
            .result()
            .await
    }

    /// Handle to the latest run of a workflow id
    pub async fn get_handle<O>(&self, workflow_id: &str) -> Result<WorkflowHandle<O>, ClientError> {
        let execution = self.engine.latest_run(workflow_id).await?;
        Ok(WorkflowHandle::new(
            Arc::clone(&self.engine),
            execution.id,
            execution.workflow_type,
        ))
    }

    /// Handle to a specific run
    pub async fn get_run_handle<O>(
        &self,
        execution: &ExecutionId,
    ) -> Result<WorkflowHandle<O>, ClientError> {
        let execution = self
            .engine
            .store()
            .get_execution(execution)
            .await
            .map_err(EngineError::from)?;
        Ok(WorkflowHandle::new(
            Arc::clone(&self.engine),
            execution.id,
            execution.workflow_type,
        ))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Handle to one workflow run
///
/// `O` is the workflow's output type, used to decode the result.
pub struct WorkflowHandle<O> {
    engine: Arc<Engine>,
    execution: ExecutionId,
    workflow_type: String,
    _output: PhantomData<fn() -> O>,
}

impl<O> WorkflowHandle<O> {
    fn new(engine: Arc<Engine>, execution: ExecutionId, workflow_type: String) -> Self {
        Self {
            engine,
            execution,
            workflow_type,
            _output: PhantomData,
        }
    }

    pub fn execution(&self) -> &ExecutionId {
        &self.execution
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Wait for the run to close and return its raw outcome
    pub async fn raw_result(&self) -> Result<Value, ClientError> {
        let execution = self.engine.wait_closed(&self.execution).await?;
        match execution.status {
            WorkflowStatus::Completed => Ok(execution.result.unwrap_or(Value::Null)),
            _ => Err(WorkflowFailureError {
                execution: execution.id,
                workflow_type: execution.workflow_type,
                cause: execution
                    .failure
                    .unwrap_or_else(|| Failure::cancelled("workflow closed without a result")),
            }
            .into()),
        }
    }

    /// Ask the run to cancel
    ///
    /// The workflow sees outstanding activities and children fail with a
    /// cancellation and decides how to end.
    pub async fn cancel(&self, reason: &str) -> Result<(), ClientError> {
        self.engine.request_cancel(&self.execution, reason).await?;
        Ok(())
    }

    /// Close the run without running workflow code
    pub async fn terminate(&self, reason: &str) -> Result<(), ClientError> {
        self.engine.terminate(&self.execution, reason).await?;
        Ok(())
    }

    /// Current execution record
    pub async fn describe(&self) -> Result<WorkflowExecution, ClientError> {
        self.engine
            .store()
            .get_execution(&self.execution)
            .await
            .map_err(|e| ClientError::from(EngineError::from(e)))
    }

    /// Full event history
    pub async fn history(&self) -> Result<Vec<Event>, ClientError> {
        self.engine
            .store()
            .load_events(&self.execution)
            .await
            .map_err(|e| ClientError::from(EngineError::from(e)))
    }
}

impl<O: DeserializeOwned> WorkflowHandle<O> {
    /// Wait for the run to close and decode its result
    pub async fn result(&self) -> Result<O, ClientError> {
        let value = self.raw_result().await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl<O> Clone for WorkflowHandle<O> {
    fn clone(&self) -> Self {
        Self::new(
            Arc::clone(&self.engine),
            self.execution.clone(),
            self.workflow_type.clone(),
        )
    }
}

impl<O> fmt::Debug for WorkflowHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("execution", &self.execution)
            .field("workflow_type", &self.workflow_type)
            .finish()
    }
}
