//! Workflows and activities shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_durable::prelude::*;
use keel_durable::worker::PollerConfig;
use serde::{Deserialize, Serialize};

pub const QUEUE: &str = "default";

// =============================================================================
// Activities
// =============================================================================

/// Counts how often it ran
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicU32>);

impl Calls {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct Greet(pub Calls);

#[async_trait]
impl Activity for Greet {
    const TYPE: &'static str = "greet";
    type Input = String;
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, name: String) -> Result<String, ActivityError> {
        self.0.bump();
        Ok(format!("Hello, {}!", name))
    }
}

pub struct Shout(pub Calls);

#[async_trait]
impl Activity for Shout {
    const TYPE: &'static str = "shout";
    type Input = String;
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, text: String) -> Result<String, ActivityError> {
        self.0.bump();
        Ok(text.to_uppercase())
    }
}

/// Always raises a retryable error
pub struct AlwaysFails(pub Calls);

#[async_trait]
impl Activity for AlwaysFails {
    const TYPE: &'static str = "always_fails";
    type Input = Value;
    type Output = ();

    async fn execute(&self, _ctx: &ActivityContext, _input: Value) -> Result<(), ActivityError> {
        self.0.bump();
        Err(ActivityError::retryable("Exception from activity"))
    }
}

/// Raises an error marked non-retryable
pub struct Rejects(pub Calls);

#[async_trait]
impl Activity for Rejects {
    const TYPE: &'static str = "rejects";
    type Input = Value;
    type Output = ();

    async fn execute(&self, _ctx: &ActivityContext, _input: Value) -> Result<(), ActivityError> {
        self.0.bump();
        Err(ActivityError::non_retryable("Non-retryable exception from activity"))
    }
}

/// Raises an error whose type the caller's policy lists as non-retryable
pub struct BadInput(pub Calls);

#[async_trait]
impl Activity for BadInput {
    const TYPE: &'static str = "bad_input";
    type Input = Value;
    type Output = ();

    async fn execute(&self, _ctx: &ActivityContext, _input: Value) -> Result<(), ActivityError> {
        self.0.bump();
        Err(ActivityError::retryable("input rejected").with_type("ValueError"))
    }
}

/// Sleeps for the given number of milliseconds unless cancelled
pub struct Sleep(pub Calls);

#[async_trait]
impl Activity for Sleep {
    const TYPE: &'static str = "sleep";
    type Input = u64;
    type Output = ();

    async fn execute(&self, ctx: &ActivityContext, millis: u64) -> Result<(), ActivityError> {
        self.0.bump();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
            _ = ctx.cancelled() => Err(ActivityError::non_retryable("cancelled")),
        }
    }
}

// =============================================================================
// Workflows
// =============================================================================

/// One activity call, described as data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityCall {
    pub activity_type: String,
    pub input: Value,
    #[serde(default)]
    pub options: Option<ActivityOptions>,
}

impl ActivityCall {
    pub fn new(activity_type: &str, input: Value) -> Self {
        Self {
            activity_type: activity_type.to_string(),
            input,
            options: None,
        }
    }

    pub fn with_options(mut self, options: ActivityOptions) -> Self {
        self.options = Some(options);
        self
    }

    fn action(&self, activity_id: &str) -> WorkflowAction {
        match &self.options {
            Some(options) => WorkflowAction::schedule_activity_with(
                activity_id,
                self.activity_type.clone(),
                self.input.clone(),
                options.clone(),
            ),
            None => WorkflowAction::schedule_activity(
                activity_id,
                self.activity_type.clone(),
                self.input.clone(),
            ),
        }
    }
}

/// Runs one activity and returns its result; failures escape
pub struct CallActivity {
    call: ActivityCall,
}

impl Workflow for CallActivity {
    const TYPE: &'static str = "call_activity";
    type Input = ActivityCall;
    type Output = Value;

    fn new(call: ActivityCall) -> Self {
        Self { call }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![self.call.action("call")])
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

/// Runs [`CallActivity`] as a child and returns its result; failures escape
pub struct CallChild {
    call: ActivityCall,
}

impl Workflow for CallChild {
    const TYPE: &'static str = "call_child";
    type Input = ActivityCall;
    type Output = Value;

    fn new(call: ActivityCall) -> Self {
        Self { call }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::start_child(
            "child",
            CallActivity::TYPE,
            encode(&self.call)?,
        )])
    }

    fn on_activity_resolved(
        &mut self,
        _ctx: &mut WorkflowContext,
        _activity_id: &str,
        _result: Result<Value, Failure>,
    ) -> WorkflowStep {
        Ok(vec![])
    }

    fn on_child_resolved(
        &mut self,
        _ctx: &mut WorkflowContext,
        _child_key: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(result?)])
    }
}

/// Greets, then shouts the greeting
pub struct GreetThenShout {
    name: String,
}

impl Workflow for GreetThenShout {
    const TYPE: &'static str = "greet_then_shout";
    type Input = String;
    type Output = String;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity(
            "greet",
            Greet::TYPE,
            json!(self.name),
        )])
    }

    fn on_activity_resolved(
        &mut self,
        _ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        let value = result?;
        match activity_id {
            "greet" => Ok(vec![WorkflowAction::schedule_activity(
                "shout",
                Shout::TYPE,
                value,
            )]),
            _ => Ok(vec![WorkflowAction::complete(value)]),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

pub fn poller() -> PollerConfig {
    PollerConfig::new()
        .with_min_interval(Duration::from_millis(5))
        .with_max_interval(Duration::from_millis(50))
}

/// Worker with every test workflow registered and no activities
pub fn worker(engine: &Arc<Engine>) -> Worker {
    let mut worker = Worker::new(
        Arc::clone(engine),
        WorkerConfig::new(QUEUE)
            .with_poller(poller())
            .with_shutdown_timeout(Duration::from_secs(2)),
    );
    worker
        .register_workflow::<CallActivity>()
        .register_workflow::<CallChild>()
        .register_workflow::<GreetThenShout>();
    worker
}

pub fn memory_engine() -> Arc<Engine> {
    Arc::new(Engine::new(Arc::new(InMemoryWorkflowEventStore::new())))
}

/// Wait for a run to close, failing the test after ten seconds
pub async fn closed(engine: &Engine, id: &ExecutionId) -> keel_durable::persistence::WorkflowExecution {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_closed(id))
        .await
        .expect("workflow did not close in time")
        .expect("wait_closed failed")
}

/// Fixed, immediate retries
pub fn retries(max_attempts: u32) -> ActivityOptions {
    ActivityOptions::default().with_retry(RetryPolicy::fixed(Duration::ZERO, max_attempts))
}
