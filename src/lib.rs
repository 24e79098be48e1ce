//! # brrtpipe
//!
//! **brrtpipe** is a cooperative, coroutine-backed request pipeline for Rust. Requests walk an
//! ordered chain of middleware entries; blocking work is pushed onto a bounded worker pool; and
//! several independent dispatcher nodes run side by side under a supervisor that restarts them
//! when they crash.
//!
//! ## Architecture
//!
//! - **[`middleware`]** - Entry registration, scoping and chain compilation
//! - **[`dispatcher`]** - Single-threaded event loop that steps many requests through their chains
//! - **[`worker_pool`]** - Bounded pool of `may` coroutines with admission control
//! - **[`cluster`]** - Supervisor running N dispatcher nodes with restart and health reporting
//! - **[`observe`]** - Structured pipeline events and the sinks that consume them
//! - **[`config`]** / **[`runtime_config`]** - YAML and `BRRTP_*` environment configuration
//! - **[`logging`]** - `tracing-subscriber` setup (JSON or pretty, sampling, async output)
//!
//! ### Request Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Caller
//!     participant Cluster as ClusterSupervisor
//!     participant Node as Dispatcher node
//!     participant Chain as Compiled chain
//!     participant Pool as WorkerPool
//!
//!     Caller->>Cluster: dispatch(request)
//!     Cluster->>Node: submit (round-robin, healthy first)
//!     Node->>Chain: compile(path) (cached per signature)
//!     loop normal segment
//!         Node->>Chain: entry.handle(ctx)
//!         alt Flow::Offload
//!             Node->>Pool: submit(task)
//!             Note over Node: other requests keep running
//!             Pool-->>Node: result slot filled
//!             Node->>Chain: resume(ctx, value)
//!         end
//!     end
//!     alt Flow::Fail
//!         Node->>Chain: error handlers in order
//!     end
//!     Node-->>Caller: Response (+ x-request-id)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use brrtpipe::{ClusterConfig, ClusterSupervisor, ErrorResponder, Flow, MiddlewareRegistry,
//!                Pipeline, Request, RequestContext};
//!
//! let registry = Arc::new(MiddlewareRegistry::new());
//! registry.use_prefix("/hello", "hello", |_: &mut RequestContext| {
//!     Flow::json(200, &serde_json::json!({ "hello": "world" }))
//! })?;
//! registry.use_error("responder", ErrorResponder::default())?;
//!
//! let cluster = ClusterSupervisor::new(Pipeline::new(registry), ClusterConfig::default());
//! cluster.start(4)?;
//! let response = cluster.dispatch(Request::get("/hello"))?;
//! assert_eq!(response.status, 200);
//! ```

pub mod app_scope;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod logging;
pub mod middleware;
pub mod observe;
pub mod runtime_config;
pub mod worker_pool;

pub use app_scope::AppScope;
pub use cluster::{ClusterConfig, ClusterHealth, ClusterSupervisor, NodeHealth, NodeId};
pub use config::PipelineConfig;
pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherHandle, Pipeline, Request, RequestContext, Response,
};
pub use error::{ClusterError, DispatchError, ErrorKind, PipelineError, RegistryError};
pub use ids::{RequestId, TaskId};
pub use middleware::{ErrorResponder, Flow, Middleware, MiddlewareRegistry};
pub use observe::{EventSink, Observers, PipelineEvent};
pub use worker_pool::{Task, TaskHandle, WorkerPool, WorkerPoolConfig};
