#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use brrtpipe::cluster::{ClusterConfig, ClusterSupervisor, NodeHealth};
use brrtpipe::dispatcher::{DispatcherConfig, Pipeline, Request, RequestContext};
use brrtpipe::error::{ClusterError, DispatchError, RegistryError};
use brrtpipe::middleware::{ErrorResponder, Flow, MiddlewareRegistry};
use brrtpipe::worker_pool::Task;
use common::{fast_dispatcher_config, observers_with, pool, wait_until, EventLog};
use serde_json::json;

const SETTLE: Duration = Duration::from_secs(3);

fn cluster_config(restart_backoff_ms: u64) -> ClusterConfig {
    ClusterConfig {
        node_count: 3,
        restart_backoff: Duration::from_millis(restart_backoff_ms),
        max_restarts_per_window: 5,
        restart_window: Duration::from_secs(60),
        degraded_in_flight: 1024,
    }
}

fn demo_registry() -> Arc<MiddlewareRegistry> {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_prefix("/slow", "slow", |_: &mut RequestContext| {
            let task = Task::new(|| {
                may::coroutine::sleep(Duration::from_millis(300));
                Ok(json!("slow done"))
            });
            Flow::offload(task, |_, value| Flow::json(200, &value))
        })
        .unwrap();
    registry
        .use_prefix("/hang", "hang", |_: &mut RequestContext| Flow::Halt)
        .unwrap();
    registry
        .use_all("ok", |_: &mut RequestContext| {
            Flow::json(200, &json!({ "ok": true }))
        })
        .unwrap();
    registry.use_error("responder", ErrorResponder::default()).unwrap();
    registry
}

fn started(nodes: usize, config: ClusterConfig, dispatcher: DispatcherConfig) -> ClusterSupervisor {
    let pipeline = Pipeline::new(demo_registry())
        .with_pool(pool(4, 64))
        .with_config(dispatcher);
    let supervisor = ClusterSupervisor::new(pipeline, config);
    supervisor.start(nodes).unwrap();
    assert!(
        wait_until(SETTLE, || supervisor.health().healthy == nodes),
        "nodes never became healthy: {:?}",
        supervisor.health()
    );
    supervisor
}

#[test]
fn test_start_reports_all_nodes_healthy() {
    let supervisor = started(3, cluster_config(50), fast_dispatcher_config());
    let health = supervisor.health();

    assert_eq!(health.total(), 3);
    assert_eq!(health.serving(), 3);
    assert!(health.nodes.iter().all(|n| n.generation == 1 && n.restarts == 0));
    assert_eq!(supervisor.dispatch(Request::get("/")).unwrap().status, 200);

    assert!(matches!(supervisor.start(3), Err(ClusterError::AlreadyStarted)));
    supervisor.shutdown();
    assert_eq!(supervisor.health().terminated, 3);
}

#[test]
fn test_start_rejects_invalid_config() {
    let pipeline = Pipeline::new(demo_registry()).with_config(fast_dispatcher_config());
    let supervisor = ClusterSupervisor::new(
        pipeline,
        ClusterConfig {
            degraded_in_flight: 0,
            ..cluster_config(50)
        },
    );

    match supervisor.start(2) {
        Err(ClusterError::InvalidConfig(err)) => assert_eq!(err.field, "degraded_in_flight"),
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
    assert!(!supervisor.pipeline().registry.is_frozen());
    assert_eq!(supervisor.health().total(), 0);
    assert!(matches!(
        supervisor.dispatch(Request::get("/")),
        Err(ClusterError::NotStarted)
    ));
}

#[test]
fn test_round_robin_over_healthy_nodes() {
    let supervisor = started(3, cluster_config(50), fast_dispatcher_config());

    let mut per_node = [0usize; 3];
    for _ in 0..9 {
        let (node, pending) = supervisor.route(Request::get("/")).unwrap();
        assert_eq!(pending.wait().unwrap().status, 200);
        per_node[node] += 1;
    }
    assert_eq!(per_node, [3, 3, 3]);
}

#[test]
fn test_registration_rejected_once_serving() {
    let supervisor = started(2, cluster_config(50), fast_dispatcher_config());
    let registry = &supervisor.pipeline().registry;

    assert!(registry.is_frozen());
    let err = registry
        .use_all("late", |_: &mut RequestContext| Flow::Next)
        .unwrap_err();
    assert_eq!(err, RegistryError::Frozen);
}

#[test]
fn test_kill_isolates_node_and_restarts_it() {
    let events = Arc::new(EventLog::default());
    let pipeline = Pipeline::new(demo_registry())
        .with_pool(pool(8, 64))
        .with_config(fast_dispatcher_config())
        .with_observers(observers_with(&events));
    let supervisor = ClusterSupervisor::new(pipeline, cluster_config(200));
    supervisor.start(3).unwrap();
    assert!(wait_until(SETTLE, || supervisor.health().healthy == 3));

    let pending: Vec<_> = (0..6)
        .map(|_| supervisor.route(Request::get("/slow")).unwrap())
        .collect();
    std::thread::sleep(Duration::from_millis(50));

    supervisor.kill(1).unwrap();
    let health = supervisor.health();
    assert_eq!(health.healthy, 2);
    assert_eq!(health.nodes[1].health, NodeHealth::Restarting);

    for (node, pending) in pending {
        let result = pending.wait();
        if node == 1 {
            assert_eq!(result.unwrap_err(), DispatchError::Lost);
        } else {
            let resp = result.unwrap();
            assert_eq!(resp.status, 200);
            assert_eq!(resp.body_json().unwrap(), json!("slow done"));
        }
    }

    // Traffic keeps flowing to the survivors while node 1 is down.
    for _ in 0..4 {
        let (node, pending) = supervisor.route(Request::get("/")).unwrap();
        assert_ne!(node, 1);
        assert_eq!(pending.wait().unwrap().status, 200);
    }

    assert!(wait_until(SETTLE, || supervisor.health().healthy == 3));
    let restarted = &supervisor.health().nodes[1];
    assert_eq!(restarted.restarts, 1);
    assert_eq!(restarted.generation, 2);
    assert_eq!(events.count("node_restarted:1"), 1);
    assert_eq!(supervisor.health().nodes[0].restarts, 0);
}

#[test]
fn test_restart_budget_terminates_node() {
    let config = ClusterConfig {
        max_restarts_per_window: 1,
        ..cluster_config(20)
    };
    let supervisor = started(2, config, fast_dispatcher_config());

    supervisor.kill(0).unwrap();
    assert!(wait_until(SETTLE, || supervisor.health().healthy == 2));

    supervisor.kill(0).unwrap();
    assert!(wait_until(SETTLE, || supervisor.health().terminated == 1));
    std::thread::sleep(Duration::from_millis(100));

    let health = supervisor.health();
    assert_eq!(health.nodes[0].health, NodeHealth::Terminated);
    assert_eq!(health.healthy, 1);
    for _ in 0..3 {
        assert_eq!(supervisor.route(Request::get("/")).unwrap().0, 1);
    }
}

#[test]
fn test_no_healthy_nodes() {
    let supervisor = started(1, cluster_config(5_000), fast_dispatcher_config());
    supervisor.kill(0).unwrap();

    assert!(matches!(
        supervisor.dispatch(Request::get("/")),
        Err(ClusterError::NoHealthyNodes)
    ));
    assert!(matches!(supervisor.kill(7), Err(ClusterError::UnknownNode(7))));
}

#[test]
fn test_degraded_node_only_gets_overflow() {
    let config = ClusterConfig {
        degraded_in_flight: 1,
        ..cluster_config(50)
    };
    let dispatcher = DispatcherConfig {
        idle_timeout: Duration::from_secs(30),
        ..fast_dispatcher_config()
    };
    let supervisor = started(2, config, dispatcher);

    let (busy, parked) = supervisor.route(Request::get("/hang")).unwrap();
    assert!(wait_until(SETTLE, || supervisor.health().degraded == 1));
    assert_eq!(supervisor.health().nodes[busy].health, NodeHealth::Degraded);

    for _ in 0..4 {
        let (node, pending) = supervisor.route(Request::get("/")).unwrap();
        assert_ne!(node, busy);
        assert_eq!(pending.wait().unwrap().status, 200);
    }

    supervisor.shutdown();
    assert_eq!(parked.wait().unwrap().status, 503);
}

#[test]
fn test_concurrent_callers() {
    let supervisor = Arc::new(started(3, cluster_config(50), fast_dispatcher_config()));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            std::thread::spawn(move || {
                (0..25)
                    .filter(|_| supervisor.dispatch(Request::get("/")).unwrap().status == 200)
                    .count()
            })
        })
        .collect();

    let served: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
    assert_eq!(served, 100);
}
