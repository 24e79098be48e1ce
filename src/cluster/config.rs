use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runtime_config::{available_cores, env_millis, env_parse};

/// Supervision policy for a cluster of dispatcher nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Nodes started by the CLI (default: available cores)
    pub node_count: usize,
    /// Delay between a node's abnormal exit and its restart
    #[serde(with = "crate::config::millis")]
    pub restart_backoff: Duration,
    /// Restarts allowed within `restart_window` before a node is terminated
    pub max_restarts_per_window: u32,
    #[serde(with = "crate::config::millis")]
    pub restart_window: Duration,
    /// In-flight requests at which a node reports `Degraded`
    pub degraded_in_flight: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_count: available_cores(),
            restart_backoff: Duration::from_millis(100),
            max_restarts_per_window: 5,
            restart_window: Duration::from_secs(60),
            degraded_in_flight: 1024,
        }
    }
}

impl ClusterConfig {
    /// Load from `BRRTP_NODES`, `BRRTP_RESTART_BACKOFF_MS`,
    /// `BRRTP_MAX_RESTARTS`, `BRRTP_RESTART_WINDOW_MS` and
    /// `BRRTP_DEGRADED_IN_FLIGHT`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            node_count: env_parse("BRRTP_NODES").unwrap_or(defaults.node_count),
            restart_backoff: env_millis("BRRTP_RESTART_BACKOFF_MS")
                .unwrap_or(defaults.restart_backoff),
            max_restarts_per_window: env_parse("BRRTP_MAX_RESTARTS")
                .unwrap_or(defaults.max_restarts_per_window),
            restart_window: env_millis("BRRTP_RESTART_WINDOW_MS")
                .unwrap_or(defaults.restart_window),
            degraded_in_flight: env_parse("BRRTP_DEGRADED_IN_FLIGHT")
                .unwrap_or(defaults.degraded_in_flight),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::new("node_count", "must be greater than 0"));
        }
        if self.restart_window.is_zero() {
            return Err(ConfigError::new("restart_window", "must be greater than 0"));
        }
        if self.degraded_in_flight == 0 {
            return Err(ConfigError::new("degraded_in_flight", "must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.node_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_nodes() {
        let config = ClusterConfig {
            node_count: 0,
            ..ClusterConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "node_count");
    }
}
