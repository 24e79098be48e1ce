use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use may::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::WorkerPoolConfig;
use super::task::{Task, TaskHandle, TaskResult, TaskSlot};
use crate::error::{panic_message, ConfigError, PipelineError};
use crate::ids::TaskId;

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Submissions rejected with backpressure
    pub shed_count: AtomicU64,
    /// Tasks accepted but not yet picked up by a worker (approximate)
    pub queue_depth: AtomicUsize,
    /// Total tasks accepted
    pub dispatched_count: AtomicU64,
    /// Tasks resolved with a value
    pub completed_count: AtomicU64,
    /// Tasks resolved with an error (fault, deadline, shutdown)
    pub failed_count: AtomicU64,
    /// Workers currently executing a task
    pub active_workers: AtomicUsize,
    /// Workers respawned after a task fault
    pub replaced_workers: AtomicU64,
    /// Workers that could not be spawned; each one shrinks admission by one
    pub lost_workers: AtomicUsize,
}

impl WorkerPoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dequeue(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_resolution(&self, result: &TaskResult) {
        if result.is_ok() {
            self.completed_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    pub fn get_failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    pub fn get_active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn get_replaced_workers(&self) -> u64 {
        self.replaced_workers.load(Ordering::Relaxed)
    }

    pub fn get_lost_workers(&self) -> usize {
        self.lost_workers.load(Ordering::Relaxed)
    }
}

struct QueuedTask {
    id: TaskId,
    job: Box<dyn FnOnce() -> TaskResult + Send>,
    slot: Arc<TaskSlot>,
    deadline: Instant,
    timeout: Duration,
}

/// State shared by the pool front and every worker coroutine.
struct PoolShared {
    name: String,
    config: WorkerPoolConfig,
    receiver: mpsc::Receiver<QueuedTask>,
    metrics: Arc<WorkerPoolMetrics>,
    outstanding: AtomicUsize,
    shutting_down: AtomicBool,
}

enum WorkerExit {
    Continue,
    Replace,
}

/// Bounded pool of worker coroutines executing offloaded [`Task`]s.
///
/// Admission is fail-fast: [`WorkerPool::submit`] never blocks. Once
/// `worker_count + queue_capacity` tasks are outstanding, further submissions
/// get [`PipelineError::Backpressure`] until one resolves.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Mutex<Option<mpsc::Sender<QueuedTask>>>,
}

impl WorkerPool {
    /// Create a pool and spawn its worker coroutines.
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let (tx, rx) = mpsc::channel::<QueuedTask>();

        info!(
            pool = %name,
            worker_count = config.worker_count,
            queue_capacity = config.queue_capacity,
            task_timeout_ms = config.task_timeout.as_millis() as u64,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        let shared = Arc::new(PoolShared {
            name,
            config,
            receiver: rx,
            metrics: Arc::new(WorkerPoolMetrics::new()),
            outstanding: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        for worker_id in 0..shared.config.worker_count {
            start_worker(&shared, worker_id, spawn_worker);
        }

        Ok(Self {
            shared,
            sender: Mutex::new(Some(tx)),
        })
    }

    /// Pool configured from `BRRTP_*` environment variables.
    pub fn from_env(name: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(name, WorkerPoolConfig::from_env())
    }

    /// Accept `task` or reject it immediately.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Backpressure`] - [`WorkerPool::capacity`] tasks outstanding
    /// * [`PipelineError::PoolShutdown`] - [`WorkerPool::shutdown`] was called
    pub fn submit(&self, task: Task) -> Result<TaskHandle, PipelineError> {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return Err(PipelineError::PoolShutdown);
        }

        let limit = self.capacity();
        if let Err(outstanding) =
            self.shared
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
        {
            self.shared.metrics.record_shed();
            warn!(
                pool = %self.shared.name,
                task_id = %task.id(),
                outstanding = outstanding,
                limit = limit,
                "Worker pool saturated - rejecting task"
            );
            return Err(PipelineError::Backpressure { outstanding });
        }

        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            self.release();
            return Err(PipelineError::PoolShutdown);
        };

        let (deadline, timeout) =
            task.resolve_deadline(Instant::now(), self.shared.config.task_timeout);
        let handle = task.handle();
        let (id, job, slot) = task.into_parts();
        slot.mark_pending();
        self.shared.metrics.record_dispatch();

        let queued = QueuedTask {
            id,
            job,
            slot,
            deadline,
            timeout,
        };
        let sent = sender.send(queued);
        drop(guard);
        if let Err(err) = sent {
            let queued = err.0;
            error!(
                pool = %self.shared.name,
                task_id = %id,
                "Worker pool channel disconnected"
            );
            self.shared.metrics.record_dequeue();
            self.release();
            queued.slot.fill(Err(PipelineError::PoolShutdown));
            return Err(PipelineError::PoolShutdown);
        }

        debug!(pool = %self.shared.name, task_id = %id, "Task queued");
        Ok(handle)
    }

    /// Stop accepting tasks. Queued tasks resolve with
    /// [`PipelineError::PoolShutdown`]; running ones finish normally.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(
            pool = %self.shared.name,
            outstanding = self.outstanding(),
            "Worker pool shutting down"
        );
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Admission limit: `worker_count + queue_capacity` minus lost workers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared
            .config
            .max_outstanding()
            .saturating_sub(self.shared.metrics.get_lost_workers())
    }

    /// Worker coroutines the pool is running with.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared
            .config
            .worker_count
            .saturating_sub(self.shared.metrics.get_lost_workers())
    }

    /// Tasks accepted and not yet resolved.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.shared.metrics
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    fn release(&self) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Spawn a worker, retrying once. A worker that still fails to start is
/// counted as lost.
fn start_worker<F>(shared: &Arc<PoolShared>, worker_id: usize, spawn: F)
where
    F: Fn(Arc<PoolShared>, usize) -> io::Result<()>,
{
    let result = spawn(Arc::clone(shared), worker_id).or_else(|first| {
        warn!(
            pool = %shared.name,
            worker_id = worker_id,
            error = %first,
            "Worker spawn failed, retrying"
        );
        spawn(Arc::clone(shared), worker_id)
    });
    if let Err(e) = result {
        let lost = shared.metrics.lost_workers.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            pool = %shared.name,
            worker_id = worker_id,
            lost_workers = lost,
            error = %e,
            "Failed to spawn worker coroutine; pool runs below capacity"
        );
    }
}

fn spawn_worker(shared: Arc<PoolShared>, worker_id: usize) -> io::Result<()> {
    let stack_size = shared.config.stack_size;
    // SAFETY: may's spawn is unsafe because a coroutine must not block its
    // scheduler thread on OS primitives or use thread-local storage. Workers
    // only block on may's channel; task closures are documented to follow the
    // same rule.
    #[allow(unsafe_code)]
    let spawn_result = unsafe {
        may::coroutine::Builder::new()
            .stack_size(stack_size)
            .spawn(move || worker_loop(shared, worker_id))
    };
    spawn_result.map(|_| ())
}

fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    debug!(pool = %shared.name, worker_id = worker_id, "Worker coroutine started");

    // All workers share the receiver, so they load balance across the queue.
    while let Ok(queued) = shared.receiver.recv() {
        shared.metrics.record_dequeue();
        match run_task(&shared, worker_id, queued) {
            WorkerExit::Continue => {}
            WorkerExit::Replace => {
                shared.metrics.replaced_workers.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pool = %shared.name,
                    worker_id = worker_id,
                    "Replacing faulted worker"
                );
                start_worker(&shared, worker_id, spawn_worker);
                return;
            }
        }
    }

    debug!(pool = %shared.name, worker_id = worker_id, "Worker coroutine exiting");
}

fn run_task(shared: &PoolShared, worker_id: usize, queued: QueuedTask) -> WorkerExit {
    let QueuedTask {
        id,
        job,
        slot,
        deadline,
        timeout,
    } = queued;
    let mut exit = WorkerExit::Continue;

    let result = if shared.shutting_down.load(Ordering::Acquire) {
        Err(PipelineError::PoolShutdown)
    } else if slot.is_cancelled() {
        debug!(pool = %shared.name, task_id = %id, "Skipping cancelled task");
        Err(PipelineError::internal("task cancelled before it started"))
    } else if Instant::now() >= deadline {
        debug!(pool = %shared.name, task_id = %id, "Task deadline passed while queued");
        Err(PipelineError::DeadlineExceeded(timeout))
    } else {
        debug!(
            pool = %shared.name,
            task_id = %id,
            worker_id = worker_id,
            "Worker executing task"
        );
        shared.metrics.active_workers.fetch_add(1, Ordering::Relaxed);
        let outcome = catch_unwind(AssertUnwindSafe(job));
        shared.metrics.active_workers.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(_)) if Instant::now() > deadline => {
                debug!(pool = %shared.name, task_id = %id, "Discarding late task result");
                Err(PipelineError::DeadlineExceeded(timeout))
            }
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    pool = %shared.name,
                    task_id = %id,
                    worker_id = worker_id,
                    panic_message = %message,
                    "Task panicked - CRITICAL"
                );
                exit = WorkerExit::Replace;
                Err(PipelineError::TaskFailed(message))
            }
        }
    };

    shared.metrics.record_resolution(&result);
    // free capacity before waking the submitter so it can resubmit at once
    shared.outstanding.fetch_sub(1, Ordering::AcqRel);
    slot.fill(result);
    exit
}
