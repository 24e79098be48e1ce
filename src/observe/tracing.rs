use tracing::{debug, info, warn};

use super::{EventSink, PipelineEvent};

/// Writes every pipeline event to `tracing`.
///
/// Request boundaries and restarts log at `info`, errors at `warn`, task
/// traffic at `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        match event {
            PipelineEvent::RequestStart {
                node,
                request_id,
                method,
                path,
            } => info!(
                node_id = node,
                request_id = %request_id,
                method = %method,
                path = %path,
                "Request start"
            ),
            PipelineEvent::RequestEnd {
                node,
                request_id,
                status,
                latency,
            } => info!(
                node_id = node,
                request_id = %request_id,
                status = status,
                latency_ms = latency.as_millis() as u64,
                "Request end"
            ),
            PipelineEvent::ErrorRaised {
                node,
                request_id,
                error,
                replaced,
            } => warn!(
                node_id = node,
                request_id = %request_id,
                kind = error.kind().as_str(),
                error = %error,
                replaced = replaced,
                "Error raised"
            ),
            PipelineEvent::TaskSubmitted {
                node,
                request_id,
                task_id,
            } => debug!(
                node_id = node,
                request_id = %request_id,
                task_id = %task_id,
                "Task submitted"
            ),
            PipelineEvent::TaskCompleted {
                node,
                request_id,
                task_id,
                error,
                elapsed,
            } => debug!(
                node_id = node,
                request_id = %request_id,
                task_id = %task_id,
                failed = error.is_some(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Task completed"
            ),
            PipelineEvent::NodeRestarted { node, restarts } => info!(
                node_id = node,
                restarts = restarts,
                "Node restarted"
            ),
        }
    }
}
