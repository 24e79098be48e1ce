use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::dispatcher::{RequestContext, Response};
use crate::error::{PipelineError, RegistryError};
use crate::middleware::{ErrorResponder, Flow, MiddlewareRegistry};
use crate::worker_pool::Task;

/// Default sleep for `/work` when the path carries no duration.
const DEFAULT_WORK_MS: u64 = 10;

/// Registry used by `serve`.
///
/// | Path            | Behaviour                                          |
/// |-----------------|----------------------------------------------------|
/// | `/echo`         | responds with the request body                     |
/// | `/work/<ms>`    | offloads a task sleeping `<ms>` on the worker pool |
/// | `/fail`         | fails with a validation error                      |
/// | `/hang`         | halts; resolved by the idle timeout                |
/// | `/info`         | application scope values                           |
/// | anything else   | falls off the chain (404)                          |
pub fn demo_registry() -> Result<Arc<MiddlewareRegistry>, RegistryError> {
    let registry = Arc::new(MiddlewareRegistry::new());

    registry.use_all("request_log", |ctx: &mut RequestContext| {
        debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.path,
            "Demo request received"
        );
        Flow::Next
    })?;

    registry.use_prefix("/echo", "echo", |ctx: &mut RequestContext| {
        match ctx.body.read_all() {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Flow::Respond(Response::text(200, text)),
                Err(_) => Flow::Fail(PipelineError::validation("body is not UTF-8")),
            },
            Err(e) => Flow::Fail(PipelineError::validation(format!("unreadable body: {e}"))),
        }
    })?;

    registry.use_prefix("/work", "work", |ctx: &mut RequestContext| {
        let millis = match work_millis(&ctx.path) {
            Ok(ms) => ms,
            Err(e) => return Flow::Fail(e),
        };
        let task = Task::new(move || {
            may::coroutine::sleep(Duration::from_millis(millis));
            Ok(json!({ "slept_ms": millis }))
        });
        Flow::offload(task, |ctx, value| {
            Flow::json(
                200,
                &json!({ "result": value, "request_id": ctx.request_id }),
            )
        })
    })?;

    registry.use_prefix("/fail", "fail", |_: &mut RequestContext| {
        Flow::Fail(PipelineError::validation("requested failure"))
    })?;

    registry.use_prefix("/hang", "hang", |_: &mut RequestContext| Flow::Halt)?;

    registry.use_prefix("/info", "info", |ctx: &mut RequestContext| {
        let app: serde_json::Map<String, serde_json::Value> = ctx
            .app()
            .keys()
            .filter_map(|k| ctx.app().get(k).map(|v| (k.to_string(), v.clone())))
            .collect();
        Flow::json(200, &json!({ "app": app }))
    })?;

    registry.use_error("responder", ErrorResponder::default())?;
    Ok(registry)
}

/// `/work` -> default, `/work/25` -> 25.
fn work_millis(path: &str) -> Result<u64, PipelineError> {
    match path.trim_end_matches('/').strip_prefix("/work") {
        None | Some("") => Ok(DEFAULT_WORK_MS),
        Some(rest) => rest
            .trim_start_matches('/')
            .parse()
            .map_err(|_| PipelineError::validation(format!("invalid duration in {path}"))),
    }
}
