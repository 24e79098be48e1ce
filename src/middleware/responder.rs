use tracing::error;

use super::{Flow, Middleware};
use crate::dispatcher::{RequestContext, Response};
use crate::error::{ErrorKind, PipelineError};

/// Terminal error handler that maps every [`PipelineError`] to a JSON
/// response.
///
/// Client-visible errors keep their message; defects (task faults, internal
/// errors, pool shutdown) are replaced by a generic message and logged.
/// Backpressure responses carry `retry-after`.
///
/// ```rust,ignore
/// registry.use_error("responder", ErrorResponder::default())?;
/// ```
#[derive(Debug, Clone)]
pub struct ErrorResponder {
    retry_after_secs: u64,
}

impl Default for ErrorResponder {
    fn default() -> Self {
        Self {
            retry_after_secs: 1,
        }
    }
}

impl ErrorResponder {
    #[must_use]
    pub fn new(retry_after_secs: u64) -> Self {
        Self { retry_after_secs }
    }

    /// Response for `err` on the request identified by `ctx`.
    #[must_use]
    pub fn respond(&self, ctx: &RequestContext, err: &PipelineError) -> Response {
        let message = if err.is_client_visible() {
            err.to_string()
        } else {
            if err.kind() == ErrorKind::TaskFailed {
                error!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    error = %err,
                    "Offloaded task failed - converting to internal error"
                );
            }
            "internal server error".to_string()
        };

        let mut resp = Response::json(
            err.status(),
            &serde_json::json!({
                "error": message,
                "kind": err.kind().as_str(),
                "request_id": ctx.request_id,
            }),
        );
        if err.kind() == ErrorKind::Backpressure {
            resp.set_header("retry-after", self.retry_after_secs.to_string());
        }
        resp
    }
}

impl Middleware for ErrorResponder {
    fn handle(&self, ctx: &mut RequestContext) -> Flow {
        match ctx.error() {
            Some(err) => Flow::Respond(self.respond(ctx, err)),
            None => Flow::Next,
        }
    }

    fn name(&self) -> &str {
        "error_responder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_scope::AppScope;
    use crate::dispatcher::Request;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new(Request::get("/x"), AppScope::empty(), Duration::from_secs(1))
    }

    #[test]
    fn test_validation_error_keeps_message() {
        let c = ctx();
        let resp = ErrorResponder::default().respond(&c, &PipelineError::validation("name missing"));
        assert_eq!(resp.status, 400);
        let body = resp.body_json().unwrap();
        assert_eq!(body["error"], "validation failed: name missing");
        assert_eq!(body["kind"], "validation");
    }

    #[test]
    fn test_backpressure_sets_retry_after() {
        let c = ctx();
        let resp = ErrorResponder::new(3).respond(&c, &PipelineError::Backpressure { outstanding: 4 });
        assert_eq!(resp.status, 503);
        assert_eq!(resp.get_header("Retry-After"), Some("3"));
    }

    #[test]
    fn test_task_failure_is_masked() {
        let c = ctx();
        let resp = ErrorResponder::default().respond(&c, &PipelineError::TaskFailed("secret".into()));
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body_json().unwrap()["error"], "internal server error");
    }

    #[test]
    fn test_passes_through_without_error() {
        let mut c = ctx();
        assert!(matches!(ErrorResponder::default().handle(&mut c), Flow::Next));
    }
}
