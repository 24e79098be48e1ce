use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::PipelineError;
use crate::ids::TaskId;

/// Outcome of an offloaded task.
pub type TaskResult = Result<Value, PipelineError>;

type Job = Box<dyn FnOnce() -> TaskResult + Send>;
type Waker = Box<dyn FnOnce() + Send>;

/// Observable phase of a task's result slot.
///
/// The slot only ever moves `Empty -> Pending -> Filled`, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Task built but not accepted by a pool.
    Empty,
    /// Accepted; queued or running.
    Pending,
    /// Result (value or error) delivered.
    Filled,
}

enum SlotState {
    Empty,
    Pending,
    /// `None` once the result has been taken.
    Filled(Option<TaskResult>),
}

struct SlotInner {
    state: SlotState,
    waker: Option<Waker>,
}

/// Result slot shared between the pool and the submitter.
pub(crate) struct TaskSlot {
    inner: Mutex<SlotInner>,
    ready: Condvar,
    cancelled: AtomicBool,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::Empty,
                waker: None,
            }),
            ready: Condvar::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> SlotPhase {
        match self.lock().state {
            SlotState::Empty => SlotPhase::Empty,
            SlotState::Pending => SlotPhase::Pending,
            SlotState::Filled(_) => SlotPhase::Filled,
        }
    }

    /// `Empty -> Pending`. Returns false if the slot was not empty.
    pub(crate) fn mark_pending(&self) -> bool {
        let mut inner = self.lock();
        if matches!(inner.state, SlotState::Empty) {
            inner.state = SlotState::Pending;
            true
        } else {
            false
        }
    }

    /// `Pending -> Filled`. Returns false (and drops `result`) if the slot
    /// was not pending.
    pub(crate) fn fill(&self, result: TaskResult) -> bool {
        let waker = {
            let mut inner = self.lock();
            if !matches!(inner.state, SlotState::Pending) {
                return false;
            }
            inner.state = SlotState::Filled(Some(result));
            inner.waker.take()
        };
        self.ready.notify_all();
        if let Some(wake) = waker {
            wake();
        }
        true
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// An offloaded unit of work: the job closure (which captures its input), a
/// result slot and an optional deadline.
pub struct Task {
    id: TaskId,
    job: Job,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    slot: Arc<TaskSlot>,
}

impl Task {
    #[must_use]
    pub fn new<F>(job: F) -> Self
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            job: Box::new(job),
            timeout: None,
            deadline: None,
            slot: Arc::new(TaskSlot::new()),
        }
    }

    /// Relative timeout, measured from submission. Overrides the pool default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Absolute deadline; the earlier of this and the timeout applies.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn phase(&self) -> SlotPhase {
        self.slot.phase()
    }

    /// Effective deadline when submitted at `now` with pool default `default_timeout`.
    pub(crate) fn resolve_deadline(&self, now: Instant, default_timeout: Duration) -> (Instant, Duration) {
        let timeout = self.timeout.unwrap_or(default_timeout);
        let by_timeout = now + timeout;
        match self.deadline {
            Some(d) if d < by_timeout => (d, d.saturating_duration_since(now)),
            _ => (by_timeout, timeout),
        }
    }

    pub(crate) fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            slot: Arc::clone(&self.slot),
        }
    }

    pub(crate) fn into_parts(self) -> (TaskId, Job, Arc<TaskSlot>) {
        (self.id, self.job, self.slot)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Submitter's side of a task: await, poll or cancel it.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn phase(&self) -> SlotPhase {
        self.slot.phase()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == SlotPhase::Filled
    }

    /// Take the result if the slot is filled and nobody took it yet.
    #[must_use]
    pub fn try_take(&self) -> Option<TaskResult> {
        match &mut self.slot.lock().state {
            SlotState::Filled(result) => result.take(),
            _ => None,
        }
    }

    /// Register interest in completion without blocking.
    ///
    /// `waker` runs exactly once: immediately if the slot is already filled,
    /// otherwise on the worker that fills it. It must not block. Registering
    /// again replaces a waker that has not fired yet.
    pub fn subscribe<F>(&self, waker: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.slot.lock();
            if !matches!(inner.state, SlotState::Filled(_)) {
                inner.waker = Some(Box::new(waker));
                return;
            }
        }
        waker();
    }

    /// Block the calling OS thread until the result arrives.
    ///
    /// Coroutines and dispatcher loops use [`TaskHandle::subscribe`] instead.
    pub fn wait(&self) -> TaskResult {
        let mut inner = self.slot.lock();
        loop {
            if let SlotState::Filled(result) = &mut inner.state {
                return result
                    .take()
                    .unwrap_or_else(|| Err(PipelineError::internal("task result already taken")));
            }
            inner = self
                .slot
                .ready
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`TaskHandle::wait`], giving up after `timeout`.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.slot.lock();
        loop {
            if let SlotState::Filled(result) = &mut inner.state {
                return result.take();
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            inner = self
                .slot
                .ready
                .wait_timeout(inner, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Best-effort cancellation: a task that has not started is skipped; a
    /// running one completes and its value is discarded by the caller.
    pub fn cancel(&self) {
        self.slot.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}
