//! Runs one activity attempt and classifies its outcome

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{ActivityContext, ActivityRegistry, ActivityTask};
use crate::failure::{classify, Failure, TimeoutType};

/// Executes activity attempts against a registry
///
/// Each attempt runs in its own tokio task bounded by the task's
/// start-to-close timeout. When the timeout elapses the attempt's token is
/// tripped and the task is detached; whatever it returns later is dropped.
#[derive(Debug, Clone)]
pub struct ActivityInvoker {
    registry: ActivityRegistry,
}

impl ActivityInvoker {
    pub fn new(registry: ActivityRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Run one attempt of `task`
    ///
    /// Raised errors become application failures, a panic becomes a
    /// retryable application failure of type `Panic`, an elapsed deadline
    /// becomes a start-to-close timeout.
    #[instrument(
        skip(self, task, cancel),
        fields(
            execution = %task.execution,
            activity_id = %task.activity_id,
            activity_type = %task.activity_type,
            attempt = task.attempt
        )
    )]
    pub async fn invoke(
        &self,
        task: &ActivityTask,
        cancel: CancellationToken,
    ) -> Result<Value, Failure> {
        let Some(activity) = self.registry.get(&task.activity_type) else {
            warn!("activity type is not registered on this worker");
            return Err(Failure::application(format!(
                "activity type '{}' is not registered",
                task.activity_type
            ))
            .with_error_type("ActivityNotRegistered"));
        };

        let ctx = ActivityContext::new(task, cancel.clone());
        let input = task.input.clone();
        let handle = tokio::spawn(async move {
            AssertUnwindSafe(activity.execute_json(&ctx, input))
                .catch_unwind()
                .await
        });

        match tokio::time::timeout(task.options.start_to_close_timeout, handle).await {
            Ok(Ok(Ok(Ok(value)))) => {
                debug!("activity attempt completed");
                Ok(value)
            }
            Ok(Ok(Ok(Err(error)))) => {
                debug!(error = %error, non_retryable = error.non_retryable, "activity attempt failed");
                Err(classify(&error))
            }
            Ok(Ok(Err(payload))) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "activity attempt panicked");
                Err(Failure::application(message).with_error_type("Panic"))
            }
            Ok(Err(join_error)) => {
                warn!(error = %join_error, "activity attempt aborted");
                Err(Failure::application(format!("activity attempt aborted: {}", join_error))
                    .with_error_type("Aborted"))
            }
            Err(_) => {
                cancel.cancel();
                warn!(
                    timeout_ms = task.options.start_to_close_timeout.as_millis() as u64,
                    "activity attempt exceeded start-to-close timeout"
                );
                Err(Failure::timeout(TimeoutType::StartToClose))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("activity panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("activity panicked: {}", message)
    } else {
        "activity panicked".to_string()
    }
}
