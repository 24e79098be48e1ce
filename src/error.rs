//! # Error Taxonomy
//!
//! Every failure that can travel through a chain is a [`PipelineError`]. The
//! dispatcher attaches at most one of them to a request at a time and hands it
//! to the error-handling segment; [`ErrorKind`] is the coarse classification
//! that error handlers and metrics key on.
//!
//! | Kind | Meaning | Default status |
//! |------|---------|----------------|
//! | `Validation` | bad client input | 400 |
//! | `Auth` | unauthorized (401) or forbidden (403) | 401 / 403 |
//! | `Upstream` | a downstream dependency failed | 502 |
//! | `Backpressure` | worker pool queue full, retry later | 503 |
//! | `TaskFailed` | an offloaded task faulted | 500 |
//! | `DeadlineExceeded` | request or task deadline passed | 504 |
//! | `Internal` | unclassified defect | 500 |
//! | `PoolShutdown` | worker pool stopped before the task ran | 500 |
//!
//! Registry, dispatcher-handle and cluster failures have their own enums
//! because they never flow through a chain.

use std::time::Duration;

use thiserror::Error;

use crate::cluster::NodeId;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Auth,
    Upstream,
    Backpressure,
    TaskFailed,
    DeadlineExceeded,
    Internal,
    PoolShutdown,
}

impl ErrorKind {
    /// All kinds, in a stable order (used for metric slots).
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Validation,
        ErrorKind::Auth,
        ErrorKind::Upstream,
        ErrorKind::Backpressure,
        ErrorKind::TaskFailed,
        ErrorKind::DeadlineExceeded,
        ErrorKind::Internal,
        ErrorKind::PoolShutdown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::TaskFailed => "task_failed",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Internal => "internal",
            ErrorKind::PoolShutdown => "pool_shutdown",
        }
    }

    /// Position of this kind inside [`ErrorKind::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// An error travelling through a chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("worker pool saturated ({outstanding} outstanding tasks), retry later")]
    Backpressure { outstanding: usize },

    #[error("offloaded task failed: {0}")]
    TaskFailed(String),

    #[error("deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("worker pool is shut down")]
    PoolShutdown,
}

impl PipelineError {
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    #[must_use]
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Unauthorized(_) | PipelineError::Forbidden(_) => ErrorKind::Auth,
            PipelineError::Upstream(_) => ErrorKind::Upstream,
            PipelineError::Backpressure { .. } => ErrorKind::Backpressure,
            PipelineError::TaskFailed(_) => ErrorKind::TaskFailed,
            PipelineError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            PipelineError::Internal(_) => ErrorKind::Internal,
            PipelineError::PoolShutdown => ErrorKind::PoolShutdown,
        }
    }

    /// HTTP status a client should see for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 400,
            PipelineError::Unauthorized(_) => 401,
            PipelineError::Forbidden(_) => 403,
            PipelineError::Upstream(_) => 502,
            PipelineError::Backpressure { .. } => 503,
            PipelineError::DeadlineExceeded(_) => 504,
            PipelineError::TaskFailed(_)
            | PipelineError::Internal(_)
            | PipelineError::PoolShutdown => 500,
        }
    }

    /// Whether the message may be shown to the client verbatim.
    ///
    /// Defects (task faults, internal errors) are replaced by a generic
    /// message at the response boundary.
    #[must_use]
    pub fn is_client_visible(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::TaskFailed | ErrorKind::Internal | ErrorKind::PoolShutdown
        )
    }
}

/// Failures of the middleware registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is frozen: middleware cannot be registered once serving has started")]
    Frozen,

    #[error("error-handling middleware is always global and cannot be scoped to '{0}'")]
    ScopedErrorHandler(String),

    #[error("invalid scope prefix '{0}': prefixes must start with '/'")]
    InvalidPrefix(String),
}

/// Failures of a [`DispatcherHandle`](crate::dispatcher::DispatcherHandle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher loop is not running")]
    Closed,

    #[error("dispatcher terminated before the request resolved")]
    Lost,
}

/// Rejected configuration value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures of the cluster supervisor.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster has not been started")]
    NotStarted,

    #[error("cluster is already running")]
    AlreadyStarted,

    #[error("node count must be positive")]
    NoNodes,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("no healthy or degraded node is available")]
    NoHealthyNodes,

    #[error("node {0} terminated while the request was in flight")]
    NodeLost(NodeId),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("failed to spawn node thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}
