#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use brrtpipe::dispatcher::{
    DispatcherConfig, DispatcherExit, Pipeline, Request, RequestContext, STATUS_CLIENT_CLOSED,
};
use brrtpipe::error::{DispatchError, PipelineError};
use brrtpipe::ids::RequestId;
use brrtpipe::middleware::{ErrorResponder, Flow, Middleware, MiddlewareRegistry};
use brrtpipe::worker_pool::Task;
use brrtpipe::{AppScope, Dispatcher};
use common::{fast_dispatcher_config, observers_with, pool, spawn_node, EventLog, Trail};
use serde_json::json;

fn sleeping_task(ms: u64) -> Task {
    Task::new(move || {
        may::coroutine::sleep(Duration::from_millis(ms));
        Ok(json!({ "slept_ms": ms }))
    })
}

#[test]
fn test_offload_does_not_stall_other_requests() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_prefix("/slow", "slow", |_: &mut RequestContext| {
            Flow::offload(sleeping_task(400), |_, value| Flow::json(200, &value))
        })
        .unwrap();
    registry
        .use_prefix("/fast", "fast", |_: &mut RequestContext| {
            Flow::json(200, &json!({ "fast": true }))
        })
        .unwrap();

    let (handle, _join) = spawn_node(registry, Some(pool(2, 8)), fast_dispatcher_config());

    let slow = handle.submit(Request::get("/slow")).unwrap();
    let started = Instant::now();
    let fast = handle.handle(Request::get("/fast")).unwrap();
    let fast_elapsed = started.elapsed();

    assert_eq!(fast.status, 200);
    assert!(
        fast_elapsed < Duration::from_millis(300),
        "fast request waited {fast_elapsed:?} behind an offload"
    );

    let slow = slow.wait().unwrap();
    assert_eq!(slow.status, 200);
    assert_eq!(slow.body_json().unwrap()["slept_ms"], 400);
    handle.shutdown();
}

#[test]
fn test_resume_receives_task_value_and_can_continue() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("lookup", |_: &mut RequestContext| {
            let task = Task::new(|| Ok(json!({ "user": "ada" })));
            Flow::offload(task, |ctx, value| {
                ctx.set_local("user", value["user"].clone());
                Flow::Next
            })
        })
        .unwrap();
    registry
        .use_all("render", |ctx: &mut RequestContext| {
            Flow::json(200, &json!({ "hello": ctx.local("user") }))
        })
        .unwrap();

    let (handle, _join) = spawn_node(registry, Some(pool(1, 4)), fast_dispatcher_config());
    let resp = handle.handle(Request::get("/")).unwrap();
    assert_eq!(resp.body_json().unwrap()["hello"], "ada");
    handle.shutdown();
}

#[test]
fn test_deadline_during_await_diverts_and_discards_late_result() {
    let resumed = Arc::new(AtomicBool::new(false));
    let resumed_flag = Arc::clone(&resumed);

    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("slow", move |_: &mut RequestContext| {
            let flag = Arc::clone(&resumed_flag);
            Flow::offload(sleeping_task(500), move |_, value| {
                flag.store(true, Ordering::SeqCst);
                Flow::json(200, &value)
            })
        })
        .unwrap();
    registry.use_error("responder", ErrorResponder::default()).unwrap();

    let config = DispatcherConfig {
        request_deadline: Duration::from_millis(100),
        ..fast_dispatcher_config()
    };
    let events = Arc::new(EventLog::default());
    let pipeline = Pipeline::new(registry)
        .with_pool(pool(1, 4))
        .with_config(config)
        .with_observers(observers_with(&events));
    let (handle, _join) = Dispatcher::spawn(0, pipeline).unwrap();

    let resp = handle.handle(Request::get("/report")).unwrap();
    assert_eq!(resp.status, 504);
    assert_eq!(resp.body_json().unwrap()["kind"], "deadline_exceeded");

    // Let the task finish; its value must never reach the continuation.
    std::thread::sleep(Duration::from_millis(600));
    assert!(!resumed.load(Ordering::SeqCst));
    assert_eq!(events.count("error:deadline_exceeded:false"), 1);
    assert_eq!(events.count("request_end:504"), 1);
    handle.shutdown();
}

fn short_deadline() -> DispatcherConfig {
    DispatcherConfig {
        request_deadline: Duration::from_millis(20),
        ..fast_dispatcher_config()
    }
}

#[test]
fn test_deadline_after_failing_entry_still_runs_first_error_handler() {
    let trail = Trail::new();
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all(
            "slow_fail",
            trail.then("slow_fail", |_| {
                std::thread::sleep(Duration::from_millis(60));
                Flow::Fail(PipelineError::validation("x"))
            }),
        )
        .unwrap();
    registry
        .use_error(
            "responder",
            trail.then("responder", |ctx| ErrorResponder::default().handle(ctx)),
        )
        .unwrap();

    let events = Arc::new(EventLog::default());
    let pipeline = Pipeline::new(registry)
        .with_config(short_deadline())
        .with_observers(observers_with(&events));
    let (handle, _join) = Dispatcher::spawn(0, pipeline).unwrap();

    let resp = handle.handle(Request::get("/")).unwrap();
    assert_eq!(resp.status, 504);
    assert_eq!(resp.body_json().unwrap()["kind"], "deadline_exceeded");
    assert_eq!(trail.entries(), vec!["slow_fail", "responder"]);
    assert_eq!(events.count("error:validation:false"), 1);
    assert_eq!(events.count("error:deadline_exceeded:true"), 1);
    handle.shutdown();
}

#[test]
fn test_deadline_after_error_handler_next_reaches_following_handler() {
    let trail = Trail::new();
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("deny", |_: &mut RequestContext| {
            Flow::Fail(PipelineError::upstream("db down"))
        })
        .unwrap();
    registry
        .use_error(
            "audit",
            trail.then("audit", |_| {
                std::thread::sleep(Duration::from_millis(60));
                Flow::Next
            }),
        )
        .unwrap();
    registry
        .use_error(
            "report",
            trail.then("report", |ctx| {
                let kind = ctx.error().map(|e| e.kind().as_str()).unwrap_or("none");
                Flow::json(500, &json!({ "seen": kind }))
            }),
        )
        .unwrap();

    let (handle, _join) = spawn_node(registry, None, short_deadline());
    let resp = handle.handle(Request::get("/")).unwrap();

    assert_eq!(resp.status, 500);
    assert_eq!(resp.body_json().unwrap()["seen"], "deadline_exceeded");
    assert_eq!(trail.entries(), vec!["audit", "report"]);
    handle.shutdown();
}

#[test]
fn test_backpressure_reaches_error_segment_with_retry_after() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("work", |_: &mut RequestContext| {
            Flow::offload(sleeping_task(300), |_, value| Flow::json(200, &value))
        })
        .unwrap();
    registry.use_error("responder", ErrorResponder::default()).unwrap();

    let (handle, _join) = spawn_node(registry, Some(pool(1, 0)), fast_dispatcher_config());
    let first = handle.submit(Request::get("/a")).unwrap();
    // Give the first request time to occupy the single worker.
    std::thread::sleep(Duration::from_millis(50));
    let second = handle.handle(Request::get("/b")).unwrap();

    assert_eq!(second.status, 503);
    assert_eq!(second.get_header("retry-after"), Some("1"));
    assert_eq!(first.wait().unwrap().status, 200);
    handle.shutdown();
}

#[test]
fn test_halted_request_resolved_by_idle_bound() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("swallow", |_: &mut RequestContext| Flow::Halt)
        .unwrap();

    let (handle, _join) = spawn_node(registry, None, fast_dispatcher_config());
    let started = Instant::now();
    let resp = handle.handle(Request::get("/")).unwrap();

    assert_eq!(resp.status, 504);
    assert!(resp.body.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(handle.in_flight(), 0);
    handle.shutdown();
}

#[test]
fn test_cancel_resolves_with_client_closed() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("wait", |_: &mut RequestContext| {
            Flow::offload(sleeping_task(1_000), |_, value| Flow::json(200, &value))
        })
        .unwrap();

    let (handle, _join) = spawn_node(registry, Some(pool(1, 4)), fast_dispatcher_config());
    let pending = handle.submit(Request::get("/")).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    handle.cancel(pending.request_id()).unwrap();

    let resp = pending.wait().unwrap();
    assert_eq!(resp.status, STATUS_CLIENT_CLOSED);
    handle.shutdown();
}

#[test]
fn test_request_id_header_is_honoured_and_echoed() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("id", |ctx: &mut RequestContext| {
            Flow::json(200, &json!({ "request_id": ctx.request_id }))
        })
        .unwrap();
    let (handle, _join) = spawn_node(registry, None, fast_dispatcher_config());

    let id = RequestId::new();
    let resp = handle
        .handle(Request::get("/").with_header("x-request-id", id.to_string()))
        .unwrap();
    assert_eq!(resp.get_header("x-request-id"), Some(id.to_string().as_str()));
    assert_eq!(resp.body_json().unwrap()["request_id"], id.to_string());

    // Malformed ids are replaced by a generated one.
    let resp = handle
        .handle(Request::get("/").with_header("x-request-id", "not-a-ulid"))
        .unwrap();
    let echoed = resp.get_header("x-request-id").unwrap();
    assert_ne!(echoed, "not-a-ulid");
    assert!(echoed.parse::<RequestId>().is_ok());
    handle.shutdown();
}

#[test]
fn test_app_scope_visible_to_entries() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("info", |ctx: &mut RequestContext| {
            Flow::json(200, &json!({ "service": ctx.app().get_str("service") }))
        })
        .unwrap();
    let app = AppScope::builder().insert("service", "billing").build();
    let pipeline = Pipeline::new(registry)
        .with_app(app)
        .with_config(fast_dispatcher_config());
    let (handle, _join) = Dispatcher::spawn(0, pipeline).unwrap();

    let resp = handle.handle(Request::get("/")).unwrap();
    assert_eq!(resp.body_json().unwrap()["service"], "billing");
    handle.shutdown();
}

#[test]
fn test_shutdown_answers_in_flight_with_503() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("swallow", |_: &mut RequestContext| Flow::Halt)
        .unwrap();
    let config = DispatcherConfig {
        idle_timeout: Duration::from_secs(30),
        ..fast_dispatcher_config()
    };
    let (handle, join) = spawn_node(registry, None, config);

    let pending = handle.submit(Request::get("/")).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    handle.shutdown();

    assert_eq!(pending.wait().unwrap().status, 503);
    assert_eq!(join.join().unwrap(), DispatcherExit::Shutdown);
    assert!(matches!(
        handle.submit(Request::get("/")),
        Err(DispatchError::Closed)
    ));
}

#[test]
fn test_task_failure_is_visible_to_error_handlers() {
    let registry = Arc::new(MiddlewareRegistry::new());
    registry
        .use_all("fetch", |_: &mut RequestContext| {
            let task = Task::new(|| Err(PipelineError::upstream("inventory unavailable")));
            Flow::offload(task, |_, value| Flow::json(200, &value))
        })
        .unwrap();
    registry.use_error("responder", ErrorResponder::default()).unwrap();

    let (handle, _join) = spawn_node(registry, Some(pool(1, 4)), fast_dispatcher_config());
    let resp = handle.handle(Request::get("/")).unwrap();
    assert_eq!(resp.status, 502);
    assert_eq!(
        resp.body_json().unwrap()["error"],
        "upstream failure: inventory unavailable"
    );
    handle.shutdown();
}
