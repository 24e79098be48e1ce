#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;
use std::time::Duration;

use brrtpipe::dispatcher::{Dispatcher, DispatcherConfig, DispatcherExit, DispatcherHandle, Pipeline};
use brrtpipe::middleware::{Flow, MiddlewareRegistry};
use brrtpipe::observe::{EventSink, Observers, PipelineEvent};
use brrtpipe::worker_pool::{WorkerPool, WorkerPoolConfig};
use brrtpipe::RequestContext;

static MAY_INIT: Once = Once::new();

/// Ensures May coroutines are configured only once
pub fn setup_may_runtime() {
    MAY_INIT.call_once(|| {
        may::config().set_stack_size(0x8000);
    });
}

/// Dispatcher settings with short bounds so timeout paths finish quickly.
pub fn fast_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        request_deadline: Duration::from_secs(5),
        idle_timeout: Duration::from_millis(150),
        sweep_interval: Duration::from_millis(2),
    }
}

pub fn pool(workers: usize, queue_capacity: usize) -> Arc<WorkerPool> {
    setup_may_runtime();
    Arc::new(WorkerPool::new("test", WorkerPoolConfig::new(workers, queue_capacity)).unwrap())
}

/// Spawn a standalone dispatcher node over `registry`.
pub fn spawn_node(
    registry: Arc<MiddlewareRegistry>,
    pool: Option<Arc<WorkerPool>>,
    config: DispatcherConfig,
) -> (DispatcherHandle, JoinHandle<DispatcherExit>) {
    let mut pipeline = Pipeline::new(registry).with_config(config);
    if let Some(pool) = pool {
        pipeline = pipeline.with_pool(pool);
    }
    Dispatcher::spawn(0, pipeline).unwrap()
}

/// Shared log of entry names in the order they ran.
#[derive(Clone, Default)]
pub struct Trail(Arc<Mutex<Vec<String>>>);

impl Trail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entry that records its name and continues.
    pub fn step(&self, name: &'static str) -> impl Fn(&mut RequestContext) -> Flow + Send + Sync {
        let trail = self.clone();
        move |_: &mut RequestContext| {
            trail.push(name);
            Flow::Next
        }
    }

    /// Entry that records its name and returns `flow()`.
    pub fn then<F>(&self, name: &'static str, flow: F) -> impl Fn(&mut RequestContext) -> Flow + Send + Sync
    where
        F: Fn(&mut RequestContext) -> Flow + Send + Sync,
    {
        let trail = self.clone();
        move |ctx: &mut RequestContext| {
            trail.push(name);
            flow(ctx)
        }
    }
}

/// Event sink keeping a short label per event.
#[derive(Default)]
pub struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    pub fn labels(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.labels().iter().filter(|l| l.as_str() == label).count()
    }
}

impl EventSink for EventLog {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        let label = match event {
            PipelineEvent::RequestStart { .. } => "request_start".to_string(),
            PipelineEvent::RequestEnd { status, .. } => format!("request_end:{status}"),
            PipelineEvent::ErrorRaised { error, replaced, .. } => {
                format!("error:{}:{replaced}", error.kind().as_str())
            }
            PipelineEvent::TaskSubmitted { .. } => "task_submitted".to_string(),
            PipelineEvent::TaskCompleted { error, .. } => {
                format!("task_completed:{}", error.is_none())
            }
            PipelineEvent::NodeRestarted { node, .. } => format!("node_restarted:{node}"),
        };
        self.0.lock().unwrap().push(label);
    }
}

pub fn observers_with(log: &Arc<EventLog>) -> Observers {
    Observers::new(vec![Arc::clone(log) as Arc<dyn EventSink>])
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
