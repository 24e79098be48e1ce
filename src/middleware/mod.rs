//! # Middleware Module
//!
//! Middleware entries are the steps of a request's chain. Each entry receives
//! the [`RequestContext`](crate::dispatcher::RequestContext) and returns a
//! [`Flow`] telling the dispatcher whether to continue, fail, respond, offload
//! work or stop.
//!
//! ## Registration
//!
//! ```rust,ignore
//! use brrtpipe::middleware::{Flow, MiddlewareRegistry, ErrorResponder};
//!
//! let registry = MiddlewareRegistry::new();
//! registry.use_all("request_log", |ctx: &mut RequestContext| Flow::Next)?;
//! registry.use_prefix("/api", "auth", |ctx: &mut RequestContext| {
//!     match ctx.get_header("authorization") {
//!         Some(_) => Flow::Next,
//!         None => Flow::Fail(PipelineError::Unauthorized("missing token".into())),
//!     }
//! })?;
//! registry.use_error("responder", ErrorResponder::default())?;
//! ```
//!
//! ## Chains
//!
//! [`MiddlewareRegistry::compile`] returns the [`Chain`] for a path: matching
//! normal entries in registration order followed by every error handler in
//! registration order. Chains are cached per signature and the registry is
//! frozen once serving starts.

mod chain;
mod core;
mod registry;
mod responder;

pub use chain::{Chain, EntryId, MiddlewareEntry, Role, Scope, Signature};
pub use core::{Flow, Middleware, Offload, Resume};
pub use registry::MiddlewareRegistry;
pub use responder::ErrorResponder;
