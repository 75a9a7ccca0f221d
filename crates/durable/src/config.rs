//! Environment-driven settings
//!
//! Environment variables:
//! - `KEEL_DATA_DIR`: directory of the file store; in-memory store when unset
//! - `KEEL_TASK_QUEUE`: task queue workers poll (default: `default`)
//! - `KEEL_MAX_CONCURRENT_ACTIVITIES`: activity attempts per worker (default: 10)
//! - `KEEL_SHUTDOWN_TIMEOUT_MS`: graceful shutdown timeout (default: 30000)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::DEFAULT_TASK_QUEUE;
use crate::persistence::{
    FileWorkflowEventStore, InMemoryWorkflowEventStore, StoreError, WorkflowEventStore,
};
use crate::worker::WorkerConfig;

/// Errors from reading settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// Opening the configured store failed
    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),
}

/// Engine and worker settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// File store directory
    pub data_dir: Option<PathBuf>,

    /// Task queue workers poll
    pub task_queue: String,

    /// Activity attempts per worker
    pub max_concurrent_activities: usize,

    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            max_concurrent_activities: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineSettings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which returns a variable's value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_concurrent_activities = match var("KEEL_MAX_CONCURRENT_ACTIVITIES") {
            Some(value) => parse_count("KEEL_MAX_CONCURRENT_ACTIVITIES", value)?,
            None => defaults.max_concurrent_activities,
        };

        let shutdown_timeout = match var("KEEL_SHUTDOWN_TIMEOUT_MS") {
            Some(value) => {
                let millis = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| ConfigError::Invalid {
                        name: "KEEL_SHUTDOWN_TIMEOUT_MS",
                        reason: e.to_string(),
                        value,
                    })?;
                Duration::from_millis(millis)
            }
            None => defaults.shutdown_timeout,
        };

        Ok(Self {
            data_dir: var("KEEL_DATA_DIR").map(PathBuf::from),
            task_queue: var("KEEL_TASK_QUEUE").unwrap_or(defaults.task_queue),
            max_concurrent_activities,
            shutdown_timeout,
        })
    }

    /// Open the configured store
    pub fn open_store(&self) -> Result<Arc<dyn WorkflowEventStore>, ConfigError> {
        Ok(match &self.data_dir {
            Some(dir) => Arc::new(FileWorkflowEventStore::open(dir)?),
            None => Arc::new(InMemoryWorkflowEventStore::new()),
        })
    }

    /// Worker configuration for these settings
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.task_queue.clone())
            .with_max_concurrent_activities(self.max_concurrent_activities)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

fn parse_count(name: &'static str, value: String) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            value,
            reason: "must be at least 1".to_string(),
        }),
        Ok(count) => Ok(count),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}
