//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` runs workflow ticks:
//! - Replaying a workflow from its event history
//! - Recording the commands the code issued that are not in the history yet
//! - Dispatching them (activity tasks, child runs, close notifications)
//!
//! Commands become real only once appended. Dispatch happens after the
//! append and after the execution's lock is released; anything lost to a
//! crash in between is found again by [`Engine::recover`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::coordinator::{child_execution_id, ChildStart};
use super::core::{close_update, Engine, EngineError};
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::replay_history;
use crate::activity::{ActivityRegistry, ActivityTask};
use crate::persistence::{
    ExecutionId, StoreError, WorkflowExecution, WorkflowStatus,
};
use crate::workflow::{ActivityOptions, EventKind, NewEvent, Workflow, WorkflowAction};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,

    /// Options for activities scheduled without options whose type has no
    /// registered defaults on this worker
    pub default_activity_options: ActivityOptions,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10000,
            default_activity_options: ActivityOptions::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events_per_workflow = max;
        self
    }

    pub fn with_default_activity_options(mut self, options: ActivityOptions) -> Self {
        self.default_activity_options = options;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workflow code no longer matches its recorded history
    #[error("non-determinism detected: {0}")]
    NonDeterminism(String),

    /// The history is not a valid event log
    #[error("corrupt history: {0}")]
    CorruptHistory(String),

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(ExecutionId, usize, usize),
}

/// Result of processing a workflow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Whether the workflow is closed after this tick
    pub closed: bool,

    /// Number of new events written
    pub events_written: usize,

    /// Number of activity tasks enqueued
    pub activities_scheduled: usize,

    /// Number of children started
    pub children_started: usize,
}

/// Work a tick leaves for after the lock is released
#[derive(Default)]
struct Dispatch {
    activities: Vec<ActivityTask>,
    children: Vec<ChildStart>,
    children_to_cancel: Vec<ExecutionId>,
    /// Set when this tick closed the run
    closed: Option<WorkflowExecution>,
    result: ProcessResult,
}

/// Workflow executor
///
/// The executor drives workflow state machines by replaying events and
/// processing the commands they issue. Ticks of one execution are
/// serialized by the engine's per-execution lock.
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// let engine = Arc::new(Engine::new(Arc::new(InMemoryWorkflowEventStore::new())));
/// let mut executor = WorkflowExecutor::new(engine.clone());
/// executor.register::<GreetingWorkflow>();
///
/// let id = engine.start_workflow("greeting", "greeting_workflow", "default", json!("World")).await?;
/// executor.process_workflow(&id).await?;
/// ```
pub struct WorkflowExecutor {
    engine: Arc<Engine>,
    registry: WorkflowRegistry,
    activities: ActivityRegistry,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor on an engine
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_config(engine, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(engine: Arc<Engine>, config: ExecutorConfig) -> Self {
        Self {
            engine,
            registry: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            config,
        }
    }

    /// Create an executor from prepared registries
    pub fn from_registries(
        engine: Arc<Engine>,
        registry: WorkflowRegistry,
        activities: ActivityRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            activities,
            config,
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run one tick of an execution
    ///
    /// Replays the history, appends the commands the code issued that are
    /// not recorded yet, advances the replay cursor, then dispatches.
    #[instrument(skip(self), fields(execution = %id))]
    pub async fn process_workflow(&self, id: &ExecutionId) -> Result<ProcessResult, ExecutorError> {
        let dispatch = {
            let _tick = self.engine.lock(id).await;
            self.tick(id).await?
        };
        self.dispatch(id, dispatch).await
    }

    async fn tick(&self, id: &ExecutionId) -> Result<Dispatch, ExecutorError> {
        let store = self.engine.store();
        let execution = store.get_execution(id).await?;

        match execution.status {
            WorkflowStatus::Running => {}
            status if status.is_terminal() => {
                debug!(%status, "workflow already in terminal state");
                return Ok(Dispatch {
                    result: ProcessResult {
                        closed: true,
                        ..Default::default()
                    },
                    ..Default::default()
                });
            }
            status => {
                debug!(%status, "workflow not started yet");
                return Ok(Dispatch::default());
            }
        }

        let history = store.load_events(id).await?;
        if history.len() > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                id.clone(),
                history.len(),
                self.config.max_events_per_workflow,
            ));
        }

        // Closed in the history but not in the record: a crash hit between
        // the two writes
        if let Some(last) = history.last() {
            if let Some(update) = close_update(&last.kind) {
                warn!("finishing close interrupted by a crash");
                store
                    .update_execution(id, update.with_cursor(last.sequence))
                    .await?;
                return self.closed_dispatch(id, ProcessResult::default()).await;
            }
        }

        let mut workflow = self
            .registry
            .create(&execution.workflow_type, execution.input.clone())?;
        let outcome = replay_history(workflow.as_mut(), id, &history, execution.replay_cursor)
            .inspect_err(|e| error!(error = %e, "replay failed"))?;

        let mut dispatch = Dispatch {
            children_to_cancel: outcome.children_to_cancel,
            ..Default::default()
        };
        let mut close = None;
        let mut sequence = history.len() as u64;

        for command in outcome.commands {
            let kind = match command {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    let options = self.resolve_options(&activity_type, options, &execution);
                    let task_queue = options
                        .task_queue
                        .clone()
                        .unwrap_or_else(|| execution.task_queue.clone());
                    debug!(%activity_id, %activity_type, %task_queue, "scheduling activity");

                    dispatch.activities.push(ActivityTask {
                        execution: id.clone(),
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        attempt: 1,
                        task_queue,
                        options: options.clone(),
                        scheduled_at: Utc::now(),
                    });
                    EventKind::ActivityScheduled {
                        activity_id,
                        activity_type,
                        input,
                        options,
                    }
                }

                WorkflowAction::StartChildWorkflow {
                    child_key,
                    workflow_type,
                    input,
                    options,
                } => {
                    let child = child_execution_id(id, &child_key, &options);
                    let task_queue = options
                        .task_queue
                        .unwrap_or_else(|| execution.task_queue.clone());
                    debug!(%child_key, %workflow_type, child = %child, "starting child workflow");

                    dispatch.children.push(ChildStart {
                        child_key: child_key.clone(),
                        execution: child.clone(),
                        workflow_type: workflow_type.clone(),
                        task_queue: task_queue.clone(),
                        input: input.clone(),
                    });
                    EventKind::ChildWorkflowStarted {
                        child_key,
                        workflow_id: child.workflow_id,
                        run_id: child.run_id,
                        workflow_type,
                        task_queue,
                        input,
                    }
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    info!("completing workflow");
                    EventKind::WorkflowCompleted { result }
                }

                WorkflowAction::FailWorkflow { failure } => {
                    error!(failure = %format!("{:#}", failure), "failing workflow");
                    EventKind::WorkflowFailed { failure }
                }
            };

            if close.is_none() {
                close = close_update(&kind);
            }
            store
                .append_event(id, sequence, NewEvent::new(kind))
                .await?;
            sequence += 1;
            dispatch.result.events_written += 1;
        }

        let mut update = close.unwrap_or_default();
        if let Some(last) = outcome.last_sequence {
            update = update.with_cursor(last);
        }
        let closing = update.status.is_some();
        store.update_execution(id, update).await?;

        dispatch.result.activities_scheduled = dispatch.activities.len();
        dispatch.result.children_started = dispatch.children.len();

        if closing {
            let result = std::mem::take(&mut dispatch.result);
            let mut closed = self.closed_dispatch(id, result).await?;
            closed.children = dispatch.children;
            closed.children_to_cancel = dispatch.children_to_cancel;
            return Ok(closed);
        }

        debug!(
            events_written = dispatch.result.events_written,
            activities = dispatch.result.activities_scheduled,
            "tick complete"
        );
        Ok(dispatch)
    }

    async fn closed_dispatch(
        &self,
        id: &ExecutionId,
        mut result: ProcessResult,
    ) -> Result<Dispatch, ExecutorError> {
        let execution = self.engine.store().get_execution(id).await?;
        info!(status = %execution.status, "workflow closed");
        result.closed = true;
        Ok(Dispatch {
            closed: Some(execution),
            result,
            ..Default::default()
        })
    }

    async fn dispatch(
        &self,
        id: &ExecutionId,
        dispatch: Dispatch,
    ) -> Result<ProcessResult, ExecutorError> {
        for task in dispatch.activities {
            self.engine.queues().enqueue_activity(task, Duration::ZERO);
        }

        for child in dispatch.children {
            self.engine.children().start_child(id, child).await?;
        }

        for child in dispatch.children_to_cancel {
            match self
                .engine
                .request_cancel(&child, "parent workflow cancelled")
                .await
            {
                Ok(()) | Err(EngineError::NotRunning(..)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(execution) = dispatch.closed {
            self.engine.abandon_activities(id);
            self.engine.after_close(&execution).await?;
        }

        Ok(dispatch.result)
    }

    /// Options for a new activity
    ///
    /// Explicit options win, then the defaults the activity type was
    /// registered with, then the executor's defaults. The task queue falls
    /// back to the workflow's own.
    fn resolve_options(
        &self,
        activity_type: &str,
        options: Option<ActivityOptions>,
        execution: &WorkflowExecution,
    ) -> ActivityOptions {
        let mut options = options
            .or_else(|| self.activities.options_for(activity_type))
            .unwrap_or_else(|| self.config.default_activity_options.clone());
        if options.task_queue.is_none() {
            options.task_queue = Some(execution.task_queue.clone());
        }
        options
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{Failure, FailureKind};
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::reliability::RetryPolicy;
    use crate::workflow::{WorkflowContext, WorkflowStep};
    use serde_json::{json, Value};

    struct Greeting {
        name: String,
    }

    impl Workflow for Greeting {
        const TYPE: &'static str = "greeting";
        type Input = String;
        type Output = String;

        fn new(name: String) -> Self {
            Self { name }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
            Ok(vec![WorkflowAction::schedule_activity_with(
                "compose",
                "compose_greeting",
                json!(self.name),
                ActivityOptions::default().with_retry(RetryPolicy::fixed(Duration::ZERO, 2)),
            )])
        }

        fn on_activity_resolved(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            result: Result<Value, Failure>,
        ) -> WorkflowStep {
            Ok(vec![WorkflowAction::complete(result?)])
        }
    }

    fn executor() -> WorkflowExecutor {
        let engine = Arc::new(Engine::new(Arc::new(InMemoryWorkflowEventStore::new())));
        let mut executor = WorkflowExecutor::new(engine);
        executor.register::<Greeting>();
        executor
    }

    async fn start(executor: &WorkflowExecutor) -> ExecutionId {
        executor
            .engine()
            .start_workflow("greeting", "greeting", "default", json!("World"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_tick_schedules_activity() {
        let executor = executor();
        let id = start(&executor).await;

        let result = executor.process_workflow(&id).await.unwrap();
        assert_eq!(result.events_written, 1);
        assert_eq!(result.activities_scheduled, 1);
        assert!(!result.closed);

        let task = executor
            .engine()
            .queues()
            .poll_activity("default", |_| true)
            .unwrap();
        assert_eq!(task.activity_type, "compose_greeting");
        assert_eq!(task.options.task_queue.as_deref(), Some("default"));

        let execution = executor.engine().store().get_execution(&id).await.unwrap();
        assert_eq!(execution.replay_cursor, Some(0));
    }

    #[tokio::test]
    async fn test_repeated_tick_is_idempotent() {
        let executor = executor();
        let id = start(&executor).await;

        executor.process_workflow(&id).await.unwrap();
        let second = executor.process_workflow(&id).await.unwrap();

        assert_eq!(second.events_written, 0);
        let events = executor.engine().store().load_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_completion_closes_workflow() {
        let executor = executor();
        let id = start(&executor).await;
        executor.process_workflow(&id).await.unwrap();

        let task = executor
            .engine()
            .queues()
            .poll_activity("default", |_| true)
            .unwrap();
        executor
            .engine()
            .record_activity_result(&task, Ok(json!("Hello, World!")))
            .await
            .unwrap();

        let result = executor.process_workflow(&id).await.unwrap();
        assert!(result.closed);

        let execution = executor.engine().wait_closed(&id).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.result, Some(json!("Hello, World!")));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_workflow() {
        let executor = executor();
        let id = start(&executor).await;
        executor.process_workflow(&id).await.unwrap();

        for _ in 0..2 {
            let task = executor
                .engine()
                .queues()
                .poll_activity("default", |_| true)
                .unwrap();
            executor
                .engine()
                .record_activity_result(&task, Err(Failure::application("boom")))
                .await
                .unwrap();
        }
        assert!(executor
            .engine()
            .queues()
            .poll_activity("default", |_| true)
            .is_none());

        executor.process_workflow(&id).await.unwrap();
        let execution = executor.engine().store().get_execution(&id).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Failed);

        let failure = execution.failure.unwrap();
        assert!(matches!(failure.kind(), FailureKind::Activity { attempt: 2, .. }));
        assert_eq!(failure.root_cause().message(), "boom");
    }

    #[tokio::test]
    async fn test_crash_between_close_writes_is_finished() {
        let executor = executor();
        let id = start(&executor).await;
        let store = executor.engine().store();

        // Terminal event appended, record never updated
        store
            .append_event(
                &id,
                1,
                NewEvent::new(EventKind::WorkflowCompleted {
                    result: json!("done"),
                }),
            )
            .await
            .unwrap();

        let result = executor.process_workflow(&id).await.unwrap();
        assert!(result.closed);
        let execution = store.get_execution(&id).await.unwrap();
        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.result, Some(json!("done")));
    }

    #[tokio::test]
    async fn test_unknown_workflow_type() {
        let executor = executor();
        let id = executor
            .engine()
            .start_workflow("other", "unregistered", "default", json!(null))
            .await
            .unwrap();

        let result = executor.process_workflow(&id).await;
        assert!(matches!(
            result,
            Err(ExecutorError::Registry(RegistryError::UnknownWorkflowType(_)))
        ));
    }
}
