//! # Observability Module
//!
//! The dispatcher, worker-pool glue and cluster supervisor emit structured
//! [`PipelineEvent`]s. Anything implementing [`EventSink`] can consume them;
//! two sinks ship with the crate:
//!
//! - **[`TracingSink`]** - forwards every event to `tracing` with structured fields
//! - **[`MetricsSink`]** - lock-free counters with a Prometheus text rendering
//!
//! Sinks are called synchronously on the emitting thread (the dispatcher's
//! loop thread for request events), so they must be cheap and must never
//! block.

mod metrics;
mod tracing;

use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::cluster::NodeId;
use crate::error::PipelineError;
use crate::ids::{RequestId, TaskId};

pub use self::metrics::MetricsSink;
pub use self::tracing::TracingSink;

/// Structured lifecycle event.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    RequestStart {
        node: NodeId,
        request_id: RequestId,
        method: &'a Method,
        path: &'a str,
    },
    RequestEnd {
        node: NodeId,
        request_id: RequestId,
        status: u16,
        latency: Duration,
    },
    ErrorRaised {
        node: NodeId,
        request_id: RequestId,
        error: &'a PipelineError,
        /// The error replaced another one inside the error segment.
        replaced: bool,
    },
    TaskSubmitted {
        node: NodeId,
        request_id: RequestId,
        task_id: TaskId,
    },
    TaskCompleted {
        node: NodeId,
        request_id: RequestId,
        task_id: TaskId,
        /// `None` when the task produced a value.
        error: Option<&'a PipelineError>,
        elapsed: Duration,
    },
    NodeRestarted {
        node: NodeId,
        restarts: u32,
    },
}

/// Consumer of [`PipelineEvent`]s.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &PipelineEvent<'_>);
}

/// Fan-out over a fixed set of sinks.
#[derive(Clone, Default)]
pub struct Observers {
    sinks: Arc<[Arc<dyn EventSink>]>,
}

impl Observers {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::from(sinks),
        }
    }

    /// Only the `tracing` sink.
    #[must_use]
    pub fn tracing() -> Self {
        Self::new(vec![Arc::new(TracingSink)])
    }

    #[inline]
    pub fn emit(&self, event: &PipelineEvent<'_>) {
        for sink in self.sinks.iter() {
            sink.on_event(event);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
