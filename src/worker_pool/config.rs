use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runtime_config::{env_millis, env_parse, env_size, DEFAULT_STACK_SIZE};

/// Configuration for a worker pool
///
/// At most `worker_count + queue_capacity` tasks are outstanding at once;
/// anything beyond that is rejected with a backpressure error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker coroutines
    pub worker_count: usize,
    /// Tasks that may wait for a free worker; 0 means "only while a worker is idle"
    pub queue_capacity: usize,
    /// Deadline applied to tasks that do not carry their own
    #[serde(with = "crate::config::millis")]
    pub task_timeout: Duration,
    /// Stack size for worker coroutines
    pub stack_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
            task_timeout: Duration::from_secs(30),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a custom configuration
    #[must_use]
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count,
            queue_capacity,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Load configuration from environment variables
    ///
    /// - `BRRTP_WORKERS` (default 4)
    /// - `BRRTP_QUEUE_CAPACITY` (default 1024)
    /// - `BRRTP_TASK_TIMEOUT_MS` (default 30000)
    /// - `BRRTP_STACK_SIZE` (default `0x10000`)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parse("BRRTP_WORKERS").unwrap_or(defaults.worker_count),
            queue_capacity: env_parse("BRRTP_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            task_timeout: env_millis("BRRTP_TASK_TIMEOUT_MS").unwrap_or(defaults.task_timeout),
            stack_size: env_size("BRRTP_STACK_SIZE").unwrap_or(defaults.stack_size),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::new("worker_count", "must be greater than 0"));
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::new("task_timeout", "must be greater than 0"));
        }
        if self.stack_size < 0x1000 {
            return Err(ConfigError::new("stack_size", "must be at least 4 KB"));
        }
        Ok(())
    }

    /// Maximum number of tasks accepted but not yet resolved.
    #[must_use]
    pub fn max_outstanding(&self) -> usize {
        self.worker_count.saturating_add(self.queue_capacity)
    }
}
