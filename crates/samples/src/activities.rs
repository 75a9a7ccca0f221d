// Sample activities
//
// One activity per way an activity can end: a value, a retryable exception,
// a non-retryable exception, and an error returned as data.

use keel_durable::{Activity, ActivityContext, ActivityError};

use crate::types::{
    ComposeGreetingError, ComposeGreetingInput, ComposeGreetingOutput, GreetingReply,
};

/// Message raised by the failing activities
pub const EXCEPTION_MESSAGE: &str = "Exception from activity";

/// Message carried by [`ReturnError`]'s error value
pub const ERROR_MESSAGE: &str = "Error from activity";

pub struct ComposeGreeting;

#[async_trait::async_trait]
impl Activity for ComposeGreeting {
    const TYPE: &'static str = "compose_greeting";
    type Input = ComposeGreetingInput;
    type Output = String;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: ComposeGreetingInput,
    ) -> Result<String, ActivityError> {
        tracing::info!(activity_id = %ctx.activity_id, name = %input.name, "composing greeting");
        Ok(format!("{}, {}!", input.greeting, input.name))
    }
}

/// Always raises a retryable exception
pub struct ThrowException;

#[async_trait::async_trait]
impl Activity for ThrowException {
    const TYPE: &'static str = "throw_exception";
    type Input = ComposeGreetingInput;
    type Output = ComposeGreetingOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        _input: ComposeGreetingInput,
    ) -> Result<ComposeGreetingOutput, ActivityError> {
        tracing::info!(attempt = ctx.attempt, "throwing exception");
        Err(anyhow::anyhow!(EXCEPTION_MESSAGE).into())
    }
}

/// Always raises an exception marked non-retryable
pub struct ThrowNonRetryableException;

#[async_trait::async_trait]
impl Activity for ThrowNonRetryableException {
    const TYPE: &'static str = "throw_non_retryable_exception";
    type Input = ComposeGreetingInput;
    type Output = ComposeGreetingOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        _input: ComposeGreetingInput,
    ) -> Result<ComposeGreetingOutput, ActivityError> {
        tracing::info!(attempt = ctx.attempt, "throwing non-retryable exception");
        Err(ActivityError::non_retryable(EXCEPTION_MESSAGE))
    }
}

/// Returns an error value instead of raising
pub struct ReturnError;

#[async_trait::async_trait]
impl Activity for ReturnError {
    const TYPE: &'static str = "return_error";
    type Input = ComposeGreetingInput;
    type Output = GreetingReply;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        _input: ComposeGreetingInput,
    ) -> Result<GreetingReply, ActivityError> {
        Ok(GreetingReply::Error(ComposeGreetingError {
            error: ERROR_MESSAGE.to_string(),
        }))
    }
}

/// Served by a worker on another task queue; always raises
pub struct GetGreeting;

#[async_trait::async_trait]
impl Activity for GetGreeting {
    const TYPE: &'static str = "GetGreeting";
    type Input = serde_json::Value;
    type Output = ComposeGreetingOutput;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        _input: serde_json::Value,
    ) -> Result<ComposeGreetingOutput, ActivityError> {
        tracing::info!(attempt = ctx.attempt, "remote activity failing");
        Err(ActivityError::retryable("Exception from remote activity").with_type("RemoteError"))
    }
}
