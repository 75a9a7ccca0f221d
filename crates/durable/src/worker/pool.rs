//! Worker for one task queue
//!
//! Runs workflow ticks and activity attempts with bounded concurrency and
//! graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, TaskPoller};
use crate::activity::{Activity, ActivityInvoker, ActivityRegistry, ActivityTask};
use crate::engine::{Engine, EngineError, ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
use crate::persistence::ExecutionId;
use crate::workflow::Workflow;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue this worker polls
    pub task_queue: String,

    /// Maximum concurrent activity attempts
    pub max_concurrent_activities: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrent_activities: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for a task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the task queue to poll
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// Set maximum concurrent activity attempts
    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current attempts, not taking new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} activity attempts still running")]
    ShutdownTimeout(usize),
}

type AttemptKey = (ExecutionId, String);

/// Attempts currently running on this worker
type Running = DashMap<AttemptKey, (ActivityTask, CancellationToken)>;

/// Worker executing workflow ticks and activity attempts from one task queue
///
/// # Example
///
/// ```ignore
/// use keel_durable::prelude::*;
///
/// let mut worker = Worker::new(engine.clone(), WorkerConfig::new("default"));
/// worker
///     .register_workflow::<GreetingWorkflow>()
///     .register_activity(ComposeGreeting);
///
/// worker.start()?;
///
/// // ... later, graceful shutdown
/// worker.shutdown().await?;
/// ```
pub struct Worker {
    engine: Arc<Engine>,
    config: WorkerConfig,
    executor_config: ExecutorConfig,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerStatus>,
    active_tasks: Arc<Semaphore>,
    running: Arc<Running>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a new worker
    pub fn new(engine: Arc<Engine>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrent_activities)),
            config,
            executor_config: ExecutorConfig::default(),
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            shutdown_tx,
            status: RwLock::new(WorkerStatus::Stopped),
            running: Arc::new(DashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Set the executor configuration used for workflow ticks
    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Register a workflow type
    pub fn register_workflow<W: Workflow>(&mut self) -> &mut Self {
        self.workflows.register::<W>();
        self
    }

    /// Register an activity implementation
    pub fn register_activity<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities.register(activity);
        self
    }

    /// Start the workflow and activity loops
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerStatus::Stopped {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            task_queue = %self.config.task_queue,
            workflow_types = ?self.workflows.workflow_types().collect::<Vec<_>>(),
            activity_types = ?self.activities.activity_types(),
            max_concurrent_activities = self.config.max_concurrent_activities,
            "starting worker"
        );

        let mut handles = self.handles.lock();
        handles.push(self.start_workflow_loop());
        handles.push(self.start_activity_loop());
        Ok(())
    }

    /// Shut down gracefully
    ///
    /// Stops polling, then waits up to `shutdown_timeout` for running
    /// attempts. Attempts still running after that are cancelled and put back
    /// on their queue so another worker can pick them up.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerStatus::Running {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }

        info!("initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let loops: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "worker loop panicked");
            }
        }

        let max = self.config.max_concurrent_activities;
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == max {
                debug!("all activity attempts completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let remaining = self.abandon_running();
                warn!(remaining, "shutdown timeout reached, requeued running attempts");
                *self.status.write() = WorkerStatus::Stopped;
                return Err(WorkerError::ShutdownTimeout(remaining));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!("worker stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Number of activity attempts running right now
    pub fn current_load(&self) -> usize {
        self.config.max_concurrent_activities - self.active_tasks.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn task_queue(&self) -> &str {
        &self.config.task_queue
    }

    fn abandon_running(&self) -> usize {
        let keys: Vec<AttemptKey> = self.running.iter().map(|e| e.key().clone()).collect();
        let mut requeued = 0;
        for key in keys {
            if let Some((_, (task, token))) = self.running.remove(&key) {
                token.cancel();
                self.engine.queues().enqueue_activity(task, Duration::ZERO);
                requeued += 1;
            }
        }
        requeued
    }

    fn poller(&self) -> TaskPoller {
        TaskPoller::new(
            Arc::clone(&self.engine),
            self.config.task_queue.clone(),
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        )
    }

    /// Start the workflow tick loop
    ///
    /// Ticks run one at a time; each is short and does no user I/O.
    fn start_workflow_loop(&self) -> JoinHandle<()> {
        let executor = WorkflowExecutor::from_registries(
            Arc::clone(&self.engine),
            self.workflows.clone(),
            self.activities.clone(),
            self.executor_config.clone(),
        );
        let mut poller = self.poller();

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    break;
                }

                let registry = executor.registry();
                let tasks = poller.poll_workflows(usize::MAX, |t| registry.contains(t));
                for task in tasks {
                    match executor.process_workflow(&task.execution).await {
                        Ok(result) => {
                            debug!(execution = %task.execution, ?result, "workflow task done");
                        }
                        Err(ExecutorError::NonDeterminism(message)) => {
                            error!(
                                execution = %task.execution,
                                %message,
                                "workflow code diverged from its history, execution left running"
                            );
                        }
                        Err(e) => {
                            error!(execution = %task.execution, error = %e, "workflow task failed");
                        }
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("workflow loop exited");
        })
    }

    /// Start the activity loop
    ///
    /// Also sweeps tasks that outlived their schedule-to-start timeout.
    fn start_activity_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let invoker = ActivityInvoker::new(self.activities.clone());
        let active_tasks = Arc::clone(&self.active_tasks);
        let running = Arc::clone(&self.running);
        let mut poller = self.poller();

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    break;
                }

                match engine.expire_overdue_tasks().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "schedule-to-start timeouts recorded"),
                    Err(e) => error!(error = %e, "failed to record schedule-to-start timeouts"),
                }

                let slots = active_tasks.available_permits();
                let registry = invoker.registry();
                let tasks = if slots > 0 {
                    poller.poll_activities(slots, |t| registry.contains(t))
                } else {
                    Vec::new()
                };

                for task in tasks {
                    let Ok(permit) = Arc::clone(&active_tasks).try_acquire_owned() else {
                        debug!("no permits available, returning task to its queue");
                        engine.queues().enqueue_activity(task, Duration::ZERO);
                        continue;
                    };

                    let token = engine.register_attempt(&task);
                    let key = (task.execution.clone(), task.activity_id.clone());
                    running.insert(key.clone(), (task.clone(), token.clone()));

                    let engine = Arc::clone(&engine);
                    let invoker = invoker.clone();
                    let running = Arc::clone(&running);
                    tokio::spawn(async move {
                        let outcome = invoker.invoke(&task, token).await;
                        if running.remove(&key).is_none() {
                            // Abandoned at shutdown and already requeued
                            debug!(
                                execution = %task.execution,
                                activity_id = %task.activity_id,
                                attempt = task.attempt,
                                "dropping outcome of abandoned attempt"
                            );
                            return;
                        }
                        if let Err(e) = engine.record_activity_result(&task, outcome).await {
                            error!(
                                execution = %task.execution,
                                activity_id = %task.activity_id,
                                error = %e,
                                "failed to record activity result"
                            );
                        }
                        drop(permit);
                    });
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("activity loop exited");
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityContext, ActivityError};
    use crate::failure::Failure;
    use crate::persistence::{InMemoryWorkflowEventStore, WorkflowStatus};
    use crate::reliability::RetryPolicy;
    use crate::workflow::{
        ActivityOptions, EventKind, WorkflowAction, WorkflowContext, WorkflowStep,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Activity for Flaky {
        const TYPE: &'static str = "flaky";
        type Input = String;
        type Output = String;

        fn options(&self) -> ActivityOptions {
            ActivityOptions::default().with_retry(RetryPolicy::fixed(Duration::ZERO, 3))
        }

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: String,
        ) -> Result<String, ActivityError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(ActivityError::retryable("not yet"));
            }
            Ok(format!("Hello, {}!", input))
        }
    }

    struct Slow;

    #[async_trait]
    impl Activity for Slow {
        const TYPE: &'static str = "slow";
        type Input = ();
        type Output = ();

        async fn execute(&self, ctx: &ActivityContext, _input: ()) -> Result<(), ActivityError> {
            ctx.cancelled().await;
            Err(ActivityError::non_retryable("cancelled"))
        }
    }

    struct RunsSlow;

    impl Workflow for RunsSlow {
        const TYPE: &'static str = "runs_slow";
        type Input = ();
        type Output = ();

        fn new(_input: ()) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
            Ok(vec![WorkflowAction::schedule_activity("a", "slow", json!(null))])
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

    struct Greet {
        name: String,
    }

    impl Workflow for Greet {
        const TYPE: &'static str = "greet";
        type Input = String;
        type Output = String;

        fn new(name: String) -> Self {
            Self { name }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
            Ok(vec![WorkflowAction::schedule_activity(
                "greet",
                "flaky",
                json!(self.name),
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

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(Arc::new(InMemoryWorkflowEventStore::new())))
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.task_queue, "default");
        assert_eq!(config.max_concurrent_activities, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new("greetings")
            .with_worker_id("test-worker")
            .with_max_concurrent_activities(0)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queue, "greetings");
        assert_eq!(config.max_concurrent_activities, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_worker_runs_workflow_with_retries() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let mut worker = Worker::new(engine.clone(), WorkerConfig::new("default"));
        worker.register_workflow::<Greet>().register_activity(Flaky {
            calls: calls.clone(),
        });
        worker.start().unwrap();

        let id = engine
            .start_workflow("greet-1", "greet", "default", json!("World"))
            .await
            .unwrap();
        let execution = tokio::time::timeout(Duration::from_secs(10), engine.wait_closed(&id))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.result, Some(json!("Hello, World!")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let worker = Worker::new(engine(), WorkerConfig::default());
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(WorkerError::AlreadyRunning)));
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_timeout_requeues_running_attempts() {
        let engine = engine();
        let mut worker = Worker::new(
            engine.clone(),
            WorkerConfig::new("default").with_shutdown_timeout(Duration::from_millis(50)),
        );
        worker.register_workflow::<RunsSlow>().register_activity(Slow);
        worker.start().unwrap();

        let id = engine
            .start_workflow("slow-1", "runs_slow", "default", json!(null))
            .await
            .unwrap();

        // Wait until the attempt is running
        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.current_load() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let result = worker.shutdown().await;
        assert!(matches!(result, Err(WorkerError::ShutdownTimeout(1))));

        // The cancelled attempt finishes after shutdown returned
        tokio::time::sleep(Duration::from_millis(200)).await;

        let history = engine.store().load_events(&id).await.unwrap();
        assert!(!history
            .iter()
            .any(|e| matches!(e.kind, EventKind::ActivityFailed { .. })));
        assert_eq!(
            engine.store().get_execution(&id).await.unwrap().status,
            WorkflowStatus::Running
        );
        assert_eq!(engine.queues().activity_backlog("default"), 1);
    }
}
