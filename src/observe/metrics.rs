use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{EventSink, PipelineEvent};
use crate::error::ErrorKind;

/// Sink collecting Prometheus-compatible metrics
///
/// All counters use atomic operations for thread-safe updates without locks.
///
/// Metrics collected:
/// - Requests started / finished, and the average latency
/// - Errors raised, by [`ErrorKind`]
/// - Tasks submitted / completed / failed
/// - Node restarts
pub struct MetricsSink {
    requests_started: AtomicUsize,
    requests_finished: AtomicUsize,
    total_latency_ns: AtomicU64,
    errors: [AtomicU64; ErrorKind::ALL.len()],
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    node_restarts: AtomicU64,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self {
            requests_started: AtomicUsize::new(0),
            requests_finished: AtomicUsize::new(0),
            total_latency_ns: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            node_restarts: AtomicU64::new(0),
        }
    }
}

impl MetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of requests that produced a response
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests_finished.load(Ordering::Relaxed)
    }

    /// Requests started but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.requests_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.requests_finished.load(Ordering::Relaxed))
    }

    /// Calculate the average request latency
    ///
    /// Returns zero duration if no requests have been processed yet.
    #[must_use]
    pub fn average_latency(&self) -> Duration {
        let count = self.requests_finished.load(Ordering::Relaxed) as u64;
        if count == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.total_latency_ns.load(Ordering::Relaxed) / count)
        }
    }

    #[must_use]
    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors[kind.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tasks_submitted(&self) -> u64 {
        self.tasks_submitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn node_restarts(&self) -> u64 {
        self.node_restarts.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of every counter.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = format!(
            "# HELP brrtpipe_requests_total Total number of handled requests\n\
             # TYPE brrtpipe_requests_total counter\n\
             brrtpipe_requests_total {}\n\
             # HELP brrtpipe_requests_in_flight Requests currently walking a chain\n\
             # TYPE brrtpipe_requests_in_flight gauge\n\
             brrtpipe_requests_in_flight {}\n\
             # HELP brrtpipe_request_latency_seconds Average request latency in seconds\n\
             # TYPE brrtpipe_request_latency_seconds gauge\n\
             brrtpipe_request_latency_seconds {}\n\
             # HELP brrtpipe_tasks_submitted_total Tasks offloaded to the worker pool\n\
             # TYPE brrtpipe_tasks_submitted_total counter\n\
             brrtpipe_tasks_submitted_total {}\n\
             # HELP brrtpipe_tasks_completed_total Offloaded tasks that produced a value\n\
             # TYPE brrtpipe_tasks_completed_total counter\n\
             brrtpipe_tasks_completed_total {}\n\
             # HELP brrtpipe_tasks_failed_total Offloaded tasks that resolved to an error\n\
             # TYPE brrtpipe_tasks_failed_total counter\n\
             brrtpipe_tasks_failed_total {}\n\
             # HELP brrtpipe_node_restarts_total Dispatcher node restarts\n\
             # TYPE brrtpipe_node_restarts_total counter\n\
             brrtpipe_node_restarts_total {}\n\
             # HELP brrtpipe_errors_total Errors raised inside chains, by kind\n\
             # TYPE brrtpipe_errors_total counter\n",
            self.request_count(),
            self.in_flight(),
            self.average_latency().as_secs_f64(),
            self.tasks_submitted(),
            self.tasks_completed(),
            self.tasks_failed(),
            self.node_restarts(),
        );
        for kind in ErrorKind::ALL {
            out.push_str(&format!(
                "brrtpipe_errors_total{{kind=\"{}\"}} {}\n",
                kind.as_str(),
                self.error_count(kind)
            ));
        }
        out
    }
}

impl EventSink for MetricsSink {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        match event {
            PipelineEvent::RequestStart { .. } => {
                self.requests_started.fetch_add(1, Ordering::Relaxed);
            }
            PipelineEvent::RequestEnd { latency, .. } => {
                self.requests_finished.fetch_add(1, Ordering::Relaxed);
                self.total_latency_ns
                    .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
            }
            PipelineEvent::ErrorRaised { error, .. } => {
                self.errors[error.kind().index()].fetch_add(1, Ordering::Relaxed);
            }
            PipelineEvent::TaskSubmitted { .. } => {
                self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
            }
            PipelineEvent::TaskCompleted { error, .. } => {
                if error.is_some() {
                    self.tasks_failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.tasks_completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            PipelineEvent::NodeRestarted { .. } => {
                self.node_restarts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
