#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use brrtpipe::error::PipelineError;
use brrtpipe::worker_pool::{SlotPhase, Task, WorkerPool, WorkerPoolConfig};
use common::{pool, setup_may_runtime, wait_until};
use serde_json::json;

// These tests are affected by global env vars. Use a mutex to serialize access.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

fn clean_worker_pool_env_vars() {
    std::env::remove_var("BRRTP_WORKERS");
    std::env::remove_var("BRRTP_QUEUE_CAPACITY");
    std::env::remove_var("BRRTP_TASK_TIMEOUT_MS");
    std::env::remove_var("BRRTP_STACK_SIZE");
}

fn sleeper(ms: u64) -> Task {
    Task::new(move || {
        may::coroutine::sleep(Duration::from_millis(ms));
        Ok(json!(ms))
    })
}

#[test]
fn test_zero_queue_rejects_exactly_one_of_three() {
    let pool = pool(2, 0);

    let results: Vec<_> = (0..3).map(|_| pool.submit(sleeper(150))).collect();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(PipelineError::Backpressure { .. })))
        .count();
    assert_eq!(rejected, 1);
    assert_eq!(pool.metrics().get_shed_count(), 1);

    for handle in results.into_iter().flatten() {
        assert_eq!(handle.wait(), Ok(json!(150)));
    }
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_capacity_frees_up_after_completion() {
    let pool = pool(1, 1);
    let a = pool.submit(sleeper(50)).unwrap();
    let b = pool.submit(sleeper(50)).unwrap();
    assert!(matches!(
        pool.submit(sleeper(50)),
        Err(PipelineError::Backpressure { outstanding: 2 })
    ));

    a.wait().unwrap();
    b.wait().unwrap();
    assert!(pool.submit(sleeper(1)).unwrap().wait().is_ok());
}

#[test]
fn test_never_more_than_k_running() {
    let pool = pool(3, 32);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(Task::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                may::coroutine::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }))
            .unwrap()
        })
        .collect();

    for handle in handles {
        handle.wait().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_panicking_task_fails_and_worker_is_replaced() {
    let pool = pool(1, 4);
    let handle = pool
        .submit(Task::new(|| -> Result<serde_json::Value, PipelineError> {
            panic!("task bug");
        }))
        .unwrap();

    match handle.wait() {
        Err(PipelineError::TaskFailed(message)) => assert!(message.contains("task bug")),
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    // Single worker: this only completes if a replacement was spawned.
    let next = pool.submit(Task::new(|| Ok(json!("still alive")))).unwrap();
    assert_eq!(
        next.wait_timeout(Duration::from_secs(2)),
        Some(Ok(json!("still alive")))
    );
    assert_eq!(pool.metrics().get_replaced_workers(), 1);
    assert_eq!(pool.metrics().get_failed_count(), 1);
}

#[test]
fn test_shutdown_resolves_queued_tasks() {
    let pool = pool(1, 8);
    let running = pool.submit(sleeper(100)).unwrap();
    let queued: Vec<_> = (0..3).map(|_| pool.submit(sleeper(1)).unwrap()).collect();

    pool.shutdown();
    assert!(matches!(
        pool.submit(sleeper(1)),
        Err(PipelineError::PoolShutdown)
    ));

    assert_eq!(running.wait(), Ok(json!(100)));
    for handle in queued {
        assert_eq!(handle.wait(), Err(PipelineError::PoolShutdown));
    }
}

#[test]
fn test_task_timeout_discards_late_value() {
    let pool = pool(1, 4);
    let handle = pool
        .submit(sleeper(200).with_timeout(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(
        handle.wait(),
        Err(PipelineError::DeadlineExceeded(Duration::from_millis(50)))
    );
}

#[test]
fn test_task_expiring_in_queue_is_not_run() {
    let pool = pool(1, 4);
    let blocker = pool.submit(sleeper(150)).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_flag = Arc::clone(&ran);
    let starved = pool
        .submit(
            Task::new(move || {
                ran_flag.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .with_timeout(Duration::from_millis(20)),
        )
        .unwrap();

    blocker.wait().unwrap();
    assert!(matches!(
        starved.wait(),
        Err(PipelineError::DeadlineExceeded(_))
    ));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancelled_task_is_skipped() {
    let pool = pool(1, 4);
    let blocker = pool.submit(sleeper(100)).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_flag = Arc::clone(&ran);
    let victim = pool
        .submit(Task::new(move || {
            ran_flag.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        }))
        .unwrap();
    victim.cancel();

    blocker.wait().unwrap();
    assert!(victim.wait().is_err());
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_subscribe_fires_once_on_completion() {
    let pool = pool(1, 4);
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = pool.submit(sleeper(30)).unwrap();
    assert_ne!(handle.phase(), SlotPhase::Empty);

    let counter = Arc::clone(&fired);
    handle.subscribe(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(Duration::from_secs(2), || handle.is_ready()));
    assert!(wait_until(Duration::from_secs(1), || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(handle.try_take(), Some(Ok(json!(30))));
    assert_eq!(handle.try_take(), None);
}

#[test]
fn test_pool_from_env() {
    let _guard = ENV_MUTEX.lock().unwrap();
    clean_worker_pool_env_vars();
    setup_may_runtime();

    std::env::set_var("BRRTP_WORKERS", "3");
    std::env::set_var("BRRTP_QUEUE_CAPACITY", "0");
    std::env::set_var("BRRTP_TASK_TIMEOUT_MS", "750");

    let pool = WorkerPool::from_env("env").unwrap();
    assert_eq!(
        pool.config(),
        &WorkerPoolConfig {
            worker_count: 3,
            queue_capacity: 0,
            task_timeout: Duration::from_millis(750),
            ..WorkerPoolConfig::default()
        }
    );
    assert_eq!(pool.config().max_outstanding(), 3);

    std::env::set_var("BRRTP_WORKERS", "0");
    assert!(WorkerPool::from_env("bad").is_err());
    clean_worker_pool_env_vars();
}
