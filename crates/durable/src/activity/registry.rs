//! Activity registry for type-erased activity execution

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};
use crate::workflow::ActivityOptions;

/// Type-erased activity interface
///
/// Input and output cross this boundary as JSON.
#[async_trait]
pub trait AnyActivity: Send + Sync {
    /// Get the activity type identifier
    fn activity_type(&self) -> &'static str;

    /// Options used when a workflow schedules the activity without its own
    fn options(&self) -> ActivityOptions;

    /// Decode the input, run one attempt, encode the output
    async fn execute_json(&self, ctx: &ActivityContext, input: Value)
        -> Result<Value, ActivityError>;
}

/// Wrapper to implement AnyActivity for any Activity
struct ActivityWrapper<A: Activity> {
    inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn activity_type(&self) -> &'static str {
        A::TYPE
    }

    fn options(&self) -> ActivityOptions {
        self.inner.options()
    }

    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let input: A::Input = serde_json::from_value(input).map_err(|e| {
            ActivityError::non_retryable(format!("invalid input for {}: {}", A::TYPE, e))
                .with_type("InvalidInput")
        })?;

        let output = self.inner.execute(ctx, input).await?;

        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("failed to encode output of {}: {}", A::TYPE, e))
                .with_type("InvalidOutput")
        })
    }
}

/// Registry of activity implementations available on a worker
///
/// Cloning is cheap; clones share the registered implementations.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn AnyActivity>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity implementation
    ///
    /// Registering the same type twice replaces the earlier implementation.
    pub fn register<A: Activity>(&mut self, activity: A) {
        self.activities.insert(
            A::TYPE.to_string(),
            Arc::new(ActivityWrapper { inner: activity }),
        );
    }

    /// Look up an activity by type
    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(activity_type).cloned()
    }

    /// Registered default options for an activity type
    pub fn options_for(&self, activity_type: &str) -> Option<ActivityOptions> {
        self.activities.get(activity_type).map(|a| a.options())
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Get all registered activity type names
    pub fn activity_types(&self) -> Vec<String> {
        self.activities.keys().cloned().collect()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}
