// Sample workflows
//
// Each workflow lets failures escape after logging them, so the client sees
// the full wrapped chain: ChildWorkflowFailure -> ActivityFailure ->
// ApplicationFailure.

use std::time::Duration;

use keel_durable::workflow::{decode, encode};
use keel_durable::{
    Activity, ActivityOptions, Failure, RetryPolicy, Workflow, WorkflowAction, WorkflowContext,
    WorkflowStep,
};
use serde_json::Value;
use tracing::{error, info};

use crate::activities::{
    ComposeGreeting, GetGreeting, ReturnError, ThrowException, ThrowNonRetryableException,
};
use crate::types::{ComposeGreetingInput, ComposeGreetingOutput, GreetingReply, REMOTE_TASK_QUEUE};

/// Three attempts, starting 100ms apart
pub fn retry_policy() -> RetryPolicy {
    RetryPolicy::exponential()
        .with_max_attempts(3)
        .with_initial_interval(Duration::from_millis(100))
        .with_jitter(0.0)
}

fn activity_options() -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(retry_policy())
        .with_start_to_close_timeout(Duration::from_secs(10))
}

fn greet(activity_type: &str, name: &str) -> WorkflowStep {
    Ok(vec![WorkflowAction::schedule_activity_with(
        activity_type,
        activity_type,
        encode(&ComposeGreetingInput::hello(name))?,
        activity_options(),
    )])
}

/// Log an activity failure once, then let it fail the workflow
fn escalate(ctx: &WorkflowContext, failure: Failure) -> WorkflowStep {
    if !ctx.is_replaying() {
        error!(
            workflow_id = %ctx.workflow_id(),
            cause = %failure.cause().unwrap_or(&failure),
            "(Workflow) activity error"
        );
    }
    Err(failure)
}

// =============================================================================
// Greeting
// =============================================================================

/// Composes a greeting; the happy path
pub struct GreetingWorkflow {
    name: String,
}

impl Workflow for GreetingWorkflow {
    const TYPE: &'static str = "greeting_workflow";
    type Input = String;
    type Output = String;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowStep {
        if !ctx.is_replaying() {
            info!(name = %self.name, "running workflow");
        }
        greet(ComposeGreeting::TYPE, &self.name)
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

// =============================================================================
// Exceptions
// =============================================================================

/// Calls an activity that always raises; every attempt is retried
pub struct ExceptionWorkflow {
    name: String,
}

impl Workflow for ExceptionWorkflow {
    const TYPE: &'static str = "exception_workflow";
    type Input = String;
    type Output = ComposeGreetingOutput;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowStep {
        if !ctx.is_replaying() {
            info!(name = %self.name, "running workflow");
        }
        greet(ThrowException::TYPE, &self.name)
    }

    fn on_activity_resolved(
        &mut self,
        ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        match result {
            Ok(value) => Ok(vec![WorkflowAction::complete(value)]),
            Err(failure) => escalate(ctx, failure),
        }
    }
}

/// Calls an activity whose exception is marked non-retryable
pub struct NonRetryableExceptionWorkflow {
    name: String,
}

impl Workflow for NonRetryableExceptionWorkflow {
    const TYPE: &'static str = "non_retryable_exception_workflow";
    type Input = String;
    type Output = ComposeGreetingOutput;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        greet(ThrowNonRetryableException::TYPE, &self.name)
    }

    fn on_activity_resolved(
        &mut self,
        ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        match result {
            Ok(value) => Ok(vec![WorkflowAction::complete(value)]),
            Err(failure) => escalate(ctx, failure),
        }
    }
}

/// Runs [`ExceptionWorkflow`] as a child
pub struct ExceptionInChildWorkflow {
    name: String,
}

impl Workflow for ExceptionInChildWorkflow {
    const TYPE: &'static str = "exception_in_child_workflow";
    type Input = String;
    type Output = ComposeGreetingOutput;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::start_child(
            "child",
            ExceptionWorkflow::TYPE,
            encode(&self.name)?,
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
        ctx: &mut WorkflowContext,
        _child_key: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        match result {
            Ok(value) => Ok(vec![WorkflowAction::complete(value)]),
            Err(failure) => {
                if !ctx.is_replaying() {
                    error!(failure = %format!("{:#}", failure), "(Parent Workflow) exception in child workflow");
                }
                Err(failure)
            }
        }
    }
}

/// Calls an activity served by a worker on another task queue
pub struct RemoteActivityWorkflow;

impl Workflow for RemoteActivityWorkflow {
    const TYPE: &'static str = "exception_in_remote_activity_workflow";
    type Input = String;
    type Output = ComposeGreetingOutput;

    fn new(_name: String) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity_with(
            "get_greeting",
            GetGreeting::TYPE,
            Value::Null,
            activity_options().with_task_queue(REMOTE_TASK_QUEUE),
        )])
    }

    fn on_activity_resolved(
        &mut self,
        ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        match result {
            Ok(value) => Ok(vec![WorkflowAction::complete(value)]),
            Err(failure) => escalate(ctx, failure),
        }
    }
}

// =============================================================================
// Errors as values
// =============================================================================

/// Returns whatever [`ReturnError`] returns; an error value is not a failure
pub struct ReturnErrorWorkflow {
    name: String,
}

impl Workflow for ReturnErrorWorkflow {
    const TYPE: &'static str = "return_error_workflow";
    type Input = String;
    type Output = GreetingReply;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        greet(ReturnError::TYPE, &self.name)
    }

    fn on_activity_resolved(
        &mut self,
        ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: Result<Value, Failure>,
    ) -> WorkflowStep {
        let reply: GreetingReply = decode(result?)?;
        if let GreetingReply::Error(e) = &reply {
            if !ctx.is_replaying() {
                info!(error = %e.error, "activity returned an error value");
            }
        }
        Ok(vec![WorkflowAction::complete(encode(&reply)?)])
    }
}

/// Runs [`ReturnErrorWorkflow`] as a child and turns its error value into a failure
pub struct ReturnErrorInChildWorkflow {
    name: String,
}

impl Workflow for ReturnErrorInChildWorkflow {
    const TYPE: &'static str = "return_error_in_child_workflow";
    type Input = String;
    type Output = ComposeGreetingOutput;

    fn new(name: String) -> Self {
        Self { name }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::start_child(
            "child",
            ReturnErrorWorkflow::TYPE,
            encode(&self.name)?,
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
        match decode::<GreetingReply>(result?)? {
            GreetingReply::Greeting(output) => Ok(vec![WorkflowAction::complete(encode(&output)?)]),
            GreetingReply::Error(e) => Err(Failure::application(e.error)),
        }
    }
}
