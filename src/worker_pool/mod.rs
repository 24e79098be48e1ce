//! # Worker Pool Module
//!
//! A bounded pool of `may` worker coroutines that executes offloaded
//! [`Task`]s so a dispatcher loop never blocks on heavy work.
//!
//! ## Features
//!
//! - **Fixed concurrency**: exactly `worker_count` tasks execute at once
//! - **Fail-fast admission**: beyond `worker_count + queue_capacity`
//!   outstanding tasks, [`WorkerPool::submit`] returns
//!   [`PipelineError::Backpressure`](crate::error::PipelineError::Backpressure)
//!   instead of blocking or dropping work
//! - **Deadlines**: a task that starts after its deadline is skipped, one that
//!   finishes after it has its value discarded; both resolve to `DeadlineExceeded`
//! - **Fault isolation**: a panicking task resolves to `TaskFailed` and its
//!   worker is replaced
//! - **Metrics**: queue depth, dispatched/completed/failed/shed counts
//!
//! ## Results
//!
//! Every accepted task has a single-assignment result slot that moves
//! `Empty -> Pending -> Filled` exactly once. The [`TaskHandle`] returned by
//! `submit` can poll it ([`TaskHandle::try_take`]), register a waker
//! ([`TaskHandle::subscribe`]) or block an OS thread on it
//! ([`TaskHandle::wait`]).
//!
//! ## Configuration
//!
//! - `BRRTP_WORKERS`: worker coroutines (default: 4)
//! - `BRRTP_QUEUE_CAPACITY`: tasks allowed to wait for a worker (default: 1024, 0 allowed)
//! - `BRRTP_TASK_TIMEOUT_MS`: default task deadline (default: 30000)
//! - `BRRTP_STACK_SIZE`: worker stack size (default: `0x10000`)
//!
//! Task closures run on coroutines: they may block on `may` primitives
//! (`may::coroutine::sleep`, `may::sync`) but should not park the OS thread.

mod config;
mod pool;
mod task;

pub use config::WorkerPoolConfig;
pub use pool::{WorkerPool, WorkerPoolMetrics};
pub use task::{SlotPhase, Task, TaskHandle, TaskResult};
