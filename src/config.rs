//! YAML configuration for a whole pipeline deployment.
//!
//! ```yaml
//! workers:
//!   worker_count: 8
//!   queue_capacity: 256
//!   task_timeout: 5000      # milliseconds
//! dispatcher:
//!   request_deadline: 30000
//!   idle_timeout: 10000
//! cluster:
//!   node_count: 4
//!   restart_backoff: 100
//! logging:
//!   format: pretty
//! app:
//!   service_name: demo
//! ```
//!
//! Every section is optional and falls back to its `Default`. Durations are
//! written as integer milliseconds.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app_scope::AppScope;
use crate::cluster::ClusterConfig;
use crate::dispatcher::DispatcherConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::worker_pool::WorkerPoolConfig;

/// `Duration` as integer milliseconds, for `#[serde(with = "crate::config::millis")]`.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Effective configuration of a pipeline deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub workers: WorkerPoolConfig,
    pub dispatcher: DispatcherConfig,
    pub cluster: ClusterConfig,
    pub logging: LogConfig,
    /// Seed values for the application scope.
    pub app: BTreeMap<String, Value>,
}

impl PipelineConfig {
    /// Read and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        // An empty document deserializes to unit, not a map.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Every section from its `BRRTP_*` variables; `app` stays empty.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            workers: WorkerPoolConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            cluster: ClusterConfig::from_env(),
            logging: LogConfig::from_env(),
            app: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workers.validate()?;
        self.dispatcher.validate()?;
        self.cluster.validate()
    }

    /// Build the immutable application scope from the `app` section.
    #[must_use]
    pub fn app_scope(&self) -> Arc<AppScope> {
        AppScope::builder()
            .extend(self.app.iter().map(|(k, v)| (k.clone(), v.clone())))
            .build()
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
