//! # Runtime Configuration Module
//!
//! Environment variable helpers shared by every component config, plus the
//! settings of the `may` coroutine runtime that backs the worker pool.
//!
//! ## Environment Variables
//!
//! ### `BRRTP_STACK_SIZE`
//!
//! Stack size for worker coroutines. Accepts decimal (`65536`) or
//! hexadecimal (`0x10000`). Default: `0x10000` (64 KB).
//!
//! Offloaded tasks run arbitrary user closures, so the default is larger than
//! a typical request coroutine would need. Total virtual memory is roughly
//! `stack_size × worker_count`.
//!
//! ### `BRRTP_MAY_WORKERS`
//!
//! Number of OS threads driving the coroutine scheduler. Default: the number
//! of available cores.
//!
//! ## Usage
//!
//! ```rust
//! use brrtpipe::runtime_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env();
//! config.apply();
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default coroutine stack size (64 KB).
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Parse an environment variable, `None` when unset or malformed.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Read a millisecond duration from the environment.
pub fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

/// Read a boolean flag (`1`, `true`, `yes`, `on`) from the environment.
pub fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Parse a size given in decimal or `0x` hexadecimal.
pub fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Read a stack size from the environment.
pub fn env_size(key: &str) -> Option<usize> {
    env::var(key).ok().as_deref().and_then(parse_size)
}

/// Number of cores, falling back to 1.
#[must_use]
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Coroutine runtime configuration loaded from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size for coroutines in bytes
    pub stack_size: usize,
    /// Scheduler OS threads
    pub scheduler_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            scheduler_workers: available_cores(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stack_size: env_size("BRRTP_STACK_SIZE").unwrap_or(defaults.stack_size),
            scheduler_workers: env_parse("BRRTP_MAY_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.scheduler_workers),
        }
    }

    /// Push the settings into the global `may` configuration.
    ///
    /// Must run before the first coroutine is spawned to take effect for the
    /// scheduler thread count.
    pub fn apply(&self) {
        may::config()
            .set_stack_size(self.stack_size)
            .set_workers(self.scheduler_workers);
        tracing::info!(
            stack_size = self.stack_size,
            scheduler_workers = self.scheduler_workers,
            "Coroutine runtime configured"
        );
    }
}
