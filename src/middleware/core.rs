use std::fmt;

use serde_json::Value;

use crate::dispatcher::{RequestContext, Response};
use crate::error::PipelineError;
use crate::worker_pool::Task;

/// Continuation called with the offloaded task's value once its result slot
/// fills. Task errors never reach it; they divert into the error segment.
pub type Resume = Box<dyn FnOnce(&mut RequestContext, Value) -> Flow + Send>;

/// What an entry wants the dispatcher to do next.
///
/// This is the explicit form of `next()`: instead of calling a continuation
/// closure the entry returns one of these and the dispatcher moves the cursor.
pub enum Flow {
    /// Continue with the next entry of the current segment.
    Next,
    /// Divert into the error-handling segment with this error attached.
    Fail(PipelineError),
    /// Terminal response; the chain ends here.
    Respond(Response),
    /// Submit work to the worker pool and suspend until it completes.
    Offload(Offload),
    /// Stop without continuing or responding. The dispatcher resolves the
    /// request with an empty response once the idle bound elapses.
    Halt,
}

/// A task plus the continuation that consumes its result.
pub struct Offload {
    pub task: Task,
    pub resume: Resume,
}

impl Flow {
    /// Offload `task` and continue with `resume` when it completes.
    #[must_use]
    pub fn offload<F>(task: Task, resume: F) -> Self
    where
        F: FnOnce(&mut RequestContext, Value) -> Flow + Send + 'static,
    {
        Flow::Offload(Offload {
            task,
            resume: Box::new(resume),
        })
    }

    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        Flow::Respond(Response::json(status, body))
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Next => f.write_str("Next"),
            Flow::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
            Flow::Respond(r) => f.debug_tuple("Respond").field(&r.status).finish(),
            Flow::Offload(o) => f.debug_tuple("Offload").field(&o.task.id()).finish(),
            Flow::Halt => f.write_str("Halt"),
        }
    }
}

impl From<Result<Response, PipelineError>> for Flow {
    fn from(result: Result<Response, PipelineError>) -> Self {
        match result {
            Ok(resp) => Flow::Respond(resp),
            Err(e) => Flow::Fail(e),
        }
    }
}

/// One step of a chain.
///
/// Normal entries run in registration order until one responds or fails.
/// Error-handling entries see the failure through [`RequestContext::error`].
/// Any `Fn(&mut RequestContext) -> Flow` closure is a middleware.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: &mut RequestContext) -> Flow;

    /// Name used in logs and chain introspection.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Middleware for F
where
    F: Fn(&mut RequestContext) -> Flow + Send + Sync,
{
    fn handle(&self, ctx: &mut RequestContext) -> Flow {
        self(ctx)
    }
}
