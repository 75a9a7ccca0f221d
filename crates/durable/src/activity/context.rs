//! Activity execution context

use tokio_util::sync::CancellationToken;

use super::ActivityTask;
use crate::persistence::ExecutionId;

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The attempt was cancelled: the workflow was cancelled, the attempt
    /// timed out, or the worker is shutting down
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current attempt
/// - Cooperative cancellation through [`ActivityContext::heartbeat`] and
///   [`ActivityContext::cancelled`]
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for chunk in input.chunks {
///         // Bail out if the workflow no longer wants the result
///         ctx.heartbeat()
///             .await
///             .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
///
///         process(chunk).await?;
///     }
///
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Workflow run that owns this activity
    pub execution: ExecutionId,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Registered activity type
    pub activity_type: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed, 0 means unlimited
    pub max_attempts: u32,

    cancel: CancellationToken,
}

impl ActivityContext {
    /// Create a context for one attempt of a task
    pub fn new(task: &ActivityTask, cancel: CancellationToken) -> Self {
        Self {
            execution: task.execution.clone(),
            activity_id: task.activity_id.clone(),
            activity_type: task.activity_type.clone(),
            attempt: task.attempt,
            max_attempts: task.options.retry_policy.max_attempts,
            cancel,
        }
    }

    /// Token tripped when this attempt should stop
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Checkpoint for long-running activities
    ///
    /// Yields to the runtime, then reports whether the attempt should keep
    /// going.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Cancelled`] once cancellation is requested.
    pub async fn heartbeat(&self) -> Result<(), HeartbeatError> {
        tokio::task::yield_now().await;
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }
        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::non_retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::workflow::ActivityOptions;
    use std::time::Duration;

    fn task(attempt: u32, max_attempts: u32) -> ActivityTask {
        ActivityTask {
            execution: ExecutionId::new_run("wf"),
            activity_id: "step-1".into(),
            activity_type: "compose_greeting".into(),
            input: serde_json::json!({}),
            attempt,
            task_queue: "default".into(),
            options: ActivityOptions::default()
                .with_retry(RetryPolicy::fixed(Duration::ZERO, max_attempts)),
            scheduled_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_activity_context_creation() {
        let ctx = ActivityContext::new(&task(1, 3), CancellationToken::new());

        assert_eq!(ctx.activity_id, "step-1");
        assert_eq!(ctx.activity_type, "compose_greeting");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        let ctx = ActivityContext::new(&task(3, 3), CancellationToken::new());
        assert!(ctx.is_last_attempt());

        let ctx = ActivityContext::new(&task(50, 0), CancellationToken::new());
        assert!(!ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn test_heartbeat_when_cancelled() {
        let token = CancellationToken::new();
        let ctx = ActivityContext::new(&task(1, 3), token.clone());

        assert!(ctx.heartbeat().await.is_ok());

        token.cancel();

        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.heartbeat().await,
            Err(HeartbeatError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let token = CancellationToken::new();
        let ctx = ActivityContext::new(&task(1, 3), token.clone());

        let waiter = tokio::spawn(async move { ctx.cancelled().await });
        token.cancel();
        waiter.await.unwrap();
    }
}
