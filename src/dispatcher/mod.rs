//! # Dispatcher Module
//!
//! A dispatcher node owns one event loop that walks request chains. Callers
//! talk to it through a cloneable [`DispatcherHandle`]; the loop runs on its
//! own OS thread and never blocks on middleware work.
//!
//! ## Request Flow
//!
//! 1. [`DispatcherHandle::submit`] assigns the request id (from `x-request-id`
//!    when valid) and queues the request on the loop
//! 2. The loop builds a [`RequestContext`], compiles the [`Chain`](crate::middleware::Chain)
//!    for the path and puts the request in the ready queue
//! 3. Each turn one ready request runs one entry; the returned
//!    [`Flow`](crate::middleware::Flow) moves its [`Cursor`]
//! 4. `Flow::Offload` submits a task to the worker pool and parks the request
//!    until the task's result slot fills
//! 5. The first `Flow::Respond` answers the caller through [`PendingResponse`]
//!
//! ## Fallback Responses
//!
//! | Situation | Response |
//! |-----------|----------|
//! | normal segment exhausted, no error | 404 |
//! | error segment exhausted | generic 500 |
//! | chain halted past `idle_timeout` | empty 504 |
//! | request cancelled | empty 499 |
//! | dispatcher shutting down | 503 |
//!
//! A panicking entry becomes an `Internal` error in the error segment; the
//! loop itself keeps running.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use brrtpipe::dispatcher::{Dispatcher, Pipeline, Request};
//! use brrtpipe::middleware::{Flow, MiddlewareRegistry};
//!
//! let registry = Arc::new(MiddlewareRegistry::new());
//! registry.use_all("hello", |_: &mut RequestContext| Flow::json(200, &json!({"ok": true})))?;
//! let (handle, _join) = Dispatcher::spawn(0, Pipeline::new(registry))?;
//! let response = handle.handle(Request::get("/"))?;
//! assert_eq!(response.status, 200);
//! ```

mod context;
mod core;
mod cursor;

pub use self::context::{
    Body, CancelFlag, HeaderVec, Request, RequestContext, Response, MAX_INLINE_HEADERS,
};
pub use self::core::{
    Dispatcher, DispatcherConfig, DispatcherExit, DispatcherHandle, PendingResponse, Pipeline,
    STATUS_CLIENT_CLOSED,
};
pub use self::cursor::{Cursor, Segment};
