//! Dispatcher core: the per-node event loop that walks request chains.
//!
//! One loop owns every in-flight request of its node. Each turn it drains
//! pending events, expires deadlines and idle requests, then advances exactly
//! one ready request by one entry and puts it at the back of the ready queue.
//! No request can starve another, and a request waiting on the worker pool
//! costs nothing until its task wakes it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use may::sync::mpsc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::context::{Request, RequestContext, Response};
use super::cursor::Cursor;
use crate::app_scope::AppScope;
use crate::cluster::NodeId;
use crate::error::{panic_message, ConfigError, DispatchError, PipelineError};
use crate::ids::{RequestId, TaskId};
use crate::middleware::{Chain, Flow, MiddlewareRegistry, Offload, Resume};
use crate::observe::{Observers, PipelineEvent};
use crate::runtime_config::env_millis;
use crate::worker_pool::{TaskHandle, WorkerPool};

/// Status for a request abandoned through cancellation.
pub const STATUS_CLIENT_CLOSED: u16 = 499;

/// Events processed per turn before a ready request gets stepped.
const EVENT_BATCH: usize = 64;

/// Timing configuration of a dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bound on a whole chain walk, task awaits included
    #[serde(with = "crate::config::millis")]
    pub request_deadline: Duration,
    /// How long a halted request may sit without a response
    #[serde(with = "crate::config::millis")]
    pub idle_timeout: Duration,
    /// Period of the deadline/idle sweep
    #[serde(with = "crate::config::millis")]
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(5),
        }
    }
}

impl DispatcherConfig {
    /// Load from `BRRTP_REQUEST_DEADLINE_MS`, `BRRTP_IDLE_TIMEOUT_MS` and
    /// `BRRTP_SWEEP_INTERVAL_MS`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_deadline: env_millis("BRRTP_REQUEST_DEADLINE_MS")
                .unwrap_or(defaults.request_deadline),
            idle_timeout: env_millis("BRRTP_IDLE_TIMEOUT_MS").unwrap_or(defaults.idle_timeout),
            sweep_interval: env_millis("BRRTP_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_deadline.is_zero() {
            return Err(ConfigError::new("request_deadline", "must be greater than 0"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::new("idle_timeout", "must be greater than 0"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::new("sweep_interval", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Everything a dispatcher node needs besides its id.
///
/// Cheap to clone; the cluster hands one clone to every node it starts.
#[derive(Clone)]
pub struct Pipeline {
    pub registry: Arc<MiddlewareRegistry>,
    pub app: Arc<AppScope>,
    pub pool: Option<Arc<WorkerPool>>,
    pub observers: Observers,
    pub config: DispatcherConfig,
}

impl Pipeline {
    #[must_use]
    pub fn new(registry: Arc<MiddlewareRegistry>) -> Self {
        Self {
            registry,
            app: AppScope::empty(),
            pool: None,
            observers: Observers::default(),
            config: DispatcherConfig::default(),
        }
    }

    #[must_use]
    pub fn with_app(mut self, app: Arc<AppScope>) -> Self {
        self.app = app;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("entries", &self.registry.len())
            .field("app_keys", &self.app.len())
            .field("pool", &self.pool.as_ref().map(|p| p.name().to_string()))
            .field("observers", &self.observers)
            .field("config", &self.config)
            .finish()
    }
}

/// Why a dispatcher loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherExit {
    /// Orderly shutdown; in-flight requests got 503.
    Shutdown,
    /// Simulated crash; in-flight callers observe [`DispatchError::Lost`].
    Killed,
    /// Every handle was dropped and no request was left.
    Detached,
}

impl fmt::Display for DispatcherExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DispatcherExit::Shutdown => "shutdown",
            DispatcherExit::Killed => "killed",
            DispatcherExit::Detached => "detached",
        })
    }
}

struct Inbound {
    request_id: RequestId,
    request: Request,
    reply: mpsc::Sender<Response>,
}

enum LoopEvent {
    Request(Inbound),
    TaskDone(RequestId, TaskId),
    Cancel(RequestId),
    Shutdown,
    Kill,
}

/// State shared between a loop and its handles.
struct NodeShared {
    in_flight: AtomicUsize,
    alive: AtomicBool,
}

/// Client side of a dispatcher loop. Clone freely.
#[derive(Clone)]
pub struct DispatcherHandle {
    node: NodeId,
    events: std_mpsc::Sender<LoopEvent>,
    shared: Arc<NodeShared>,
}

impl DispatcherHandle {
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Hand a request to the loop without waiting for its response.
    ///
    /// The request id is taken from a valid `x-request-id` header or
    /// generated; it is echoed on the response.
    pub fn submit(&self, request: Request) -> Result<PendingResponse, DispatchError> {
        if !self.is_alive() {
            return Err(DispatchError::Closed);
        }
        let request_id = RequestId::from_header_or_new(request.get_header("x-request-id"));
        let (reply, rx) = mpsc::channel();
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let inbound = Inbound {
            request_id,
            request,
            reply,
        };
        if self.events.send(LoopEvent::Request(inbound)).is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(DispatchError::Closed);
        }
        Ok(PendingResponse { request_id, rx })
    }

    /// Submit and block until the response arrives.
    pub fn handle(&self, request: Request) -> Result<Response, DispatchError> {
        self.submit(request)?.wait()
    }

    /// Abandon an in-flight request; it resolves with an empty 499.
    pub fn cancel(&self, request_id: RequestId) -> Result<(), DispatchError> {
        self.events
            .send(LoopEvent::Cancel(request_id))
            .map_err(|_| DispatchError::Closed)
    }

    /// Ask the loop to stop. In-flight requests resolve with 503.
    pub fn shutdown(&self) {
        if self.events.send(LoopEvent::Shutdown).is_err() {
            debug!(node_id = self.node, "Dispatcher already stopped");
        }
    }

    /// Make the loop exit as if it crashed: in-flight requests are dropped
    /// without a response.
    pub fn kill(&self) {
        if self.events.send(LoopEvent::Kill).is_err() {
            debug!(node_id = self.node, "Dispatcher already stopped");
        }
    }

    /// Requests submitted and not yet answered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("node", &self.node)
            .field("in_flight", &self.in_flight())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A response that will arrive from a dispatcher loop.
pub struct PendingResponse {
    request_id: RequestId,
    rx: mpsc::Receiver<Response>,
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl PendingResponse {
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Block until the response arrives. Safe to call from a coroutine.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Lost`] if the loop terminated without answering.
    pub fn wait(self) -> Result<Response, DispatchError> {
        self.rx.recv().map_err(|_| DispatchError::Lost)
    }
}

/// Value produced by a task, waiting to be fed to its continuation.
struct Resumption {
    resume: Resume,
    value: Value,
}

enum Stage {
    /// In the ready queue; optionally resuming after an offload.
    Ready(Option<Resumption>),
    /// Waiting for a task; not in the ready queue.
    Awaiting {
        handle: TaskHandle,
        resume: Resume,
        submitted: Instant,
    },
    /// The chain stopped without responding.
    Parked(Instant),
}

struct InFlight {
    ctx: RequestContext,
    chain: Arc<Chain>,
    cursor: Cursor,
    stage: Stage,
    reply: mpsc::Sender<Response>,
    deadline_fired: bool,
}

/// Single-threaded chain walker for one node.
pub struct Dispatcher {
    node: NodeId,
    pipeline: Pipeline,
    events_tx: std_mpsc::Sender<LoopEvent>,
    events: std_mpsc::Receiver<LoopEvent>,
    shared: Arc<NodeShared>,
    requests: HashMap<RequestId, InFlight>,
    ready: VecDeque<RequestId>,
    last_sweep: Instant,
}

impl Dispatcher {
    /// Build a loop and its first handle. Freezes the registry: once a
    /// dispatcher exists, registration is closed.
    #[must_use]
    pub fn new(node: NodeId, pipeline: Pipeline) -> (Self, DispatcherHandle) {
        pipeline.registry.freeze();
        let (events_tx, events) = std_mpsc::channel();
        let shared = Arc::new(NodeShared {
            in_flight: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        });
        let handle = DispatcherHandle {
            node,
            events: events_tx.clone(),
            shared: Arc::clone(&shared),
        };
        let dispatcher = Self {
            node,
            pipeline,
            events_tx,
            events,
            shared,
            requests: HashMap::new(),
            ready: VecDeque::new(),
            last_sweep: Instant::now(),
        };
        (dispatcher, handle)
    }

    /// Run the loop on a dedicated, named OS thread.
    pub fn spawn(
        node: NodeId,
        pipeline: Pipeline,
    ) -> io::Result<(DispatcherHandle, JoinHandle<DispatcherExit>)> {
        let (dispatcher, handle) = Self::new(node, pipeline);
        let join = std::thread::Builder::new()
            .name(format!("brrtpipe-node-{node}"))
            .spawn(move || dispatcher.run())?;
        Ok((handle, join))
    }

    /// Drive the loop until shutdown, kill, or detachment.
    pub fn run(mut self) -> DispatcherExit {
        info!(
            node_id = self.node,
            entries = self.pipeline.registry.len(),
            request_deadline_ms = self.pipeline.config.request_deadline.as_millis() as u64,
            "Dispatcher loop started"
        );

        let exit = loop {
            if let Some(exit) = self.pump_events() {
                break exit;
            }
            if self.last_sweep.elapsed() >= self.pipeline.config.sweep_interval {
                if let Some(exit) = self.sweep() {
                    break exit;
                }
            }
            self.step_next();
        };

        self.shared.alive.store(false, Ordering::Release);
        match exit {
            DispatcherExit::Shutdown => self.drain_on_shutdown(),
            DispatcherExit::Killed => {
                warn!(
                    node_id = self.node,
                    abandoned = self.requests.len(),
                    "Dispatcher loop killed"
                );
            }
            DispatcherExit::Detached => {}
        }
        info!(node_id = self.node, reason = %exit, "Dispatcher loop exiting");
        exit
    }

    fn pump_events(&mut self) -> Option<DispatcherExit> {
        let first = if self.ready.is_empty() {
            let wait = self
                .pipeline
                .config
                .sweep_interval
                .saturating_sub(self.last_sweep.elapsed());
            match self.events.recv_timeout(wait) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return Some(DispatcherExit::Detached),
            }
        } else {
            match self.events.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => return Some(DispatcherExit::Detached),
            }
        };

        let mut next = first;
        let mut budget = EVENT_BATCH;
        while let Some(event) = next {
            if let Some(exit) = self.on_event(event) {
                return Some(exit);
            }
            budget -= 1;
            if budget == 0 {
                break;
            }
            next = self.events.try_recv().ok();
        }
        None
    }

    fn on_event(&mut self, event: LoopEvent) -> Option<DispatcherExit> {
        match event {
            LoopEvent::Request(inbound) => self.admit(inbound),
            LoopEvent::TaskDone(request_id, task_id) => self.on_task_done(request_id, task_id),
            LoopEvent::Cancel(request_id) => self.on_cancel(request_id),
            LoopEvent::Shutdown => return Some(DispatcherExit::Shutdown),
            LoopEvent::Kill => return Some(DispatcherExit::Killed),
        }
        None
    }

    fn admit(&mut self, inbound: Inbound) {
        let Inbound {
            mut request_id,
            request,
            reply,
        } = inbound;
        if self.requests.contains_key(&request_id) {
            let fresh = RequestId::new();
            warn!(
                node_id = self.node,
                request_id = %request_id,
                replacement = %fresh,
                "Duplicate request id in flight - assigning a new one"
            );
            request_id = fresh;
        }

        let ctx = RequestContext::with_id(
            request,
            request_id,
            Arc::clone(&self.pipeline.app),
            self.pipeline.config.request_deadline,
        );
        let chain = self.pipeline.registry.compile(&ctx.path);
        self.pipeline.observers.emit(&PipelineEvent::RequestStart {
            node: self.node,
            request_id,
            method: &ctx.method,
            path: &ctx.path,
        });
        debug!(
            node_id = self.node,
            request_id = %request_id,
            chain = ?chain.names(),
            "Request admitted"
        );

        self.requests.insert(
            request_id,
            InFlight {
                ctx,
                chain,
                cursor: Cursor::start(),
                stage: Stage::Ready(None),
                reply,
                deadline_fired: false,
            },
        );
        self.ready.push_back(request_id);
    }

    fn step_next(&mut self) {
        while let Some(request_id) = self.ready.pop_front() {
            let Some(req) = self.requests.remove(&request_id) else {
                continue;
            };
            if !matches!(req.stage, Stage::Ready(_)) {
                self.requests.insert(request_id, req);
                continue;
            }
            self.step(request_id, req);
            return;
        }
    }

    /// Advance one request by one entry (or one continuation).
    fn step(&mut self, request_id: RequestId, mut req: InFlight) {
        if req.ctx.is_cancelled() {
            self.finish(req, Response::empty(STATUS_CLIENT_CLOSED));
            return;
        }

        let mut resumption = match std::mem::replace(&mut req.stage, Stage::Ready(None)) {
            Stage::Ready(resumption) => resumption,
            other => {
                req.stage = other;
                self.requests.insert(request_id, req);
                return;
            }
        };

        if !req.deadline_fired && Instant::now() >= req.ctx.deadline() {
            req.deadline_fired = true;
            let discarded = resumption.take().is_some();
            if discarded {
                debug!(request_id = %request_id, "Discarding task value past request deadline");
            }
            let err = PipelineError::DeadlineExceeded(self.pipeline.config.request_deadline);
            // An error handler under the cursor that has not run yet still gets its turn.
            if req.cursor.in_error_segment() && !discarded {
                self.attach(&mut req, err);
            } else {
                self.raise(&mut req, err);
            }
        }

        let flow = match resumption {
            Some(Resumption { resume, value }) => {
                let name = req
                    .cursor
                    .entry(&req.chain)
                    .map_or_else(|| Arc::from("continuation"), |e| Arc::clone(&e.name));
                let ctx = &mut req.ctx;
                guarded(self.node, &name, ctx.request_id, || resume(ctx, value))
            }
            None => {
                let Some(entry) = req.cursor.entry(&req.chain).map(Arc::clone) else {
                    self.exhausted(req);
                    return;
                };
                let ctx = &mut req.ctx;
                guarded(self.node, &entry.name, ctx.request_id, || {
                    entry.handler.handle(ctx)
                })
            }
        };
        self.apply(request_id, req, flow);
    }

    fn apply(&mut self, request_id: RequestId, mut req: InFlight, flow: Flow) {
        match flow {
            Flow::Next => {
                req.cursor.advance();
                self.requeue(request_id, req);
            }
            Flow::Fail(err) => {
                self.raise(&mut req, err);
                self.requeue(request_id, req);
            }
            Flow::Respond(response) => self.finish(req, response),
            Flow::Offload(offload) => self.offload(request_id, req, offload),
            Flow::Halt => {
                debug!(
                    node_id = self.node,
                    request_id = %request_id,
                    "Chain halted without a response"
                );
                req.stage = Stage::Parked(Instant::now());
                self.requests.insert(request_id, req);
            }
        }
    }

    fn offload(&mut self, request_id: RequestId, mut req: InFlight, offload: Offload) {
        let Offload { task, resume } = offload;
        let Some(pool) = self.pipeline.pool.as_ref() else {
            self.raise(&mut req, PipelineError::internal("no worker pool configured"));
            self.requeue(request_id, req);
            return;
        };

        let task = task.with_deadline(req.ctx.deadline());
        let task_id = task.id();
        match pool.submit(task) {
            Ok(handle) => {
                self.pipeline.observers.emit(&PipelineEvent::TaskSubmitted {
                    node: self.node,
                    request_id,
                    task_id,
                });
                let events = self.events_tx.clone();
                let node = self.node;
                handle.subscribe(move || {
                    if events.send(LoopEvent::TaskDone(request_id, task_id)).is_err() {
                        debug!(node_id = node, task_id = %task_id, "Dispatcher gone before task finished");
                    }
                });
                req.stage = Stage::Awaiting {
                    handle,
                    resume,
                    submitted: Instant::now(),
                };
                self.requests.insert(request_id, req);
            }
            Err(err) => {
                self.raise(&mut req, err);
                self.requeue(request_id, req);
            }
        }
    }

    fn on_task_done(&mut self, request_id: RequestId, task_id: TaskId) {
        let Some(mut req) = self.requests.remove(&request_id) else {
            debug!(request_id = %request_id, task_id = %task_id, "Late task result discarded");
            return;
        };
        match std::mem::replace(&mut req.stage, Stage::Ready(None)) {
            Stage::Awaiting {
                handle,
                resume,
                submitted,
            } if handle.id() == task_id => {
                let result = handle
                    .try_take()
                    .unwrap_or_else(|| Err(PipelineError::internal("task result missing")));
                self.pipeline.observers.emit(&PipelineEvent::TaskCompleted {
                    node: self.node,
                    request_id,
                    task_id,
                    error: result.as_ref().err(),
                    elapsed: submitted.elapsed(),
                });
                match result {
                    Ok(value) => req.stage = Stage::Ready(Some(Resumption { resume, value })),
                    Err(err) => {
                        if matches!(err, PipelineError::DeadlineExceeded(_))
                            && Instant::now() >= req.ctx.deadline()
                        {
                            req.deadline_fired = true;
                        }
                        self.raise(&mut req, err);
                    }
                }
                self.requests.insert(request_id, req);
                self.ready.push_back(request_id);
            }
            other => {
                debug!(request_id = %request_id, task_id = %task_id, "Stale task wakeup discarded");
                req.stage = other;
                self.requests.insert(request_id, req);
            }
        }
    }

    fn on_cancel(&mut self, request_id: RequestId) {
        match self.requests.remove(&request_id) {
            Some(req) => {
                req.ctx.cancel_flag().cancel();
                info!(node_id = self.node, request_id = %request_id, "Request cancelled");
                self.finish(req, Response::empty(STATUS_CLIENT_CLOSED));
            }
            None => debug!(request_id = %request_id, "Cancel for unknown request ignored"),
        }
    }

    /// Expire awaits past their deadline and halted requests past the idle
    /// bound; pick up cancel flags set by entries.
    fn sweep(&mut self) -> Option<DispatcherExit> {
        self.last_sweep = Instant::now();
        let now = self.last_sweep;
        let idle_timeout = self.pipeline.config.idle_timeout;

        let mut cancelled = Vec::new();
        let mut expired = Vec::new();
        let mut idle = Vec::new();
        for (id, req) in &self.requests {
            match &req.stage {
                Stage::Awaiting { .. } | Stage::Parked(_) if req.ctx.is_cancelled() => {
                    cancelled.push(*id);
                }
                Stage::Awaiting { .. } if !req.deadline_fired && now >= req.ctx.deadline() => {
                    expired.push(*id);
                }
                Stage::Parked(since) if now.duration_since(*since) >= idle_timeout => {
                    idle.push(*id);
                }
                _ => {}
            }
        }

        for id in cancelled {
            if let Some(req) = self.requests.remove(&id) {
                self.finish(req, Response::empty(STATUS_CLIENT_CLOSED));
            }
        }
        for id in expired {
            if let Some(mut req) = self.requests.remove(&id) {
                if let Stage::Awaiting { handle, .. } =
                    std::mem::replace(&mut req.stage, Stage::Ready(None))
                {
                    handle.cancel();
                }
                warn!(
                    node_id = self.node,
                    request_id = %id,
                    "Request deadline exceeded while awaiting task"
                );
                req.deadline_fired = true;
                let deadline = self.pipeline.config.request_deadline;
                self.raise(&mut req, PipelineError::DeadlineExceeded(deadline));
                self.requeue(id, req);
            }
        }
        for id in idle {
            if let Some(req) = self.requests.remove(&id) {
                warn!(node_id = self.node, request_id = %id, "Halted request hit idle bound");
                self.finish(req, Response::empty(504));
            }
        }

        // only the loop's own reference left: nobody can submit or stop us
        if self.requests.is_empty() && Arc::strong_count(&self.shared) == 1 {
            return Some(DispatcherExit::Detached);
        }
        None
    }

    /// Attach `err` and move the cursor into (or along) the error segment.
    fn raise(&self, req: &mut InFlight, err: PipelineError) {
        self.attach(req, err);
        req.cursor.divert();
    }

    /// Attach `err` without moving the cursor.
    fn attach(&self, req: &mut InFlight, err: PipelineError) {
        let request_id = req.ctx.request_id;
        let replaced = req.ctx.attach_error(err);
        if let Some(previous) = &replaced {
            warn!(
                node_id = self.node,
                request_id = %request_id,
                previous = %previous,
                "New error replaces the attached one"
            );
        }
        if let Some(current) = req.ctx.error() {
            self.pipeline.observers.emit(&PipelineEvent::ErrorRaised {
                node: self.node,
                request_id,
                error: current,
                replaced: replaced.is_some(),
            });
        }
    }

    fn exhausted(&mut self, req: InFlight) {
        let response = if req.cursor.in_error_segment() {
            warn!(
                node_id = self.node,
                request_id = %req.ctx.request_id,
                error = ?req.ctx.error(),
                "Error segment exhausted without a response"
            );
            Response::error(500, "internal server error")
        } else {
            debug!(
                node_id = self.node,
                request_id = %req.ctx.request_id,
                path = %req.ctx.path,
                "Chain exhausted without a response"
            );
            Response::error(404, "not found")
        };
        self.finish(req, response);
    }

    fn requeue(&mut self, request_id: RequestId, mut req: InFlight) {
        if !matches!(req.stage, Stage::Ready(_)) {
            req.stage = Stage::Ready(None);
        }
        self.requests.insert(request_id, req);
        self.ready.push_back(request_id);
    }

    fn finish(&self, req: InFlight, mut response: Response) {
        if let Stage::Awaiting { handle, .. } = &req.stage {
            handle.cancel();
        }
        let request_id = req.ctx.request_id;
        if response.get_header("x-request-id").is_none() {
            response.set_header("x-request-id", request_id.to_string());
        }
        self.pipeline.observers.emit(&PipelineEvent::RequestEnd {
            node: self.node,
            request_id,
            status: response.status,
            latency: req.ctx.elapsed(),
        });
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        if req.reply.send(response).is_err() {
            debug!(request_id = %request_id, "Caller dropped before the response arrived");
        }
    }

    fn drain_on_shutdown(&mut self) {
        let requests: Vec<InFlight> = self.requests.drain().map(|(_, req)| req).collect();
        self.ready.clear();
        if !requests.is_empty() {
            info!(
                node_id = self.node,
                in_flight = requests.len(),
                "Answering in-flight requests with 503"
            );
        }
        for req in requests {
            self.finish(req, Response::error(503, "dispatcher shutting down"));
        }
        while let Ok(event) = self.events.try_recv() {
            if let LoopEvent::Request(inbound) = event {
                self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                let mut response = Response::error(503, "dispatcher shutting down");
                response.set_header("x-request-id", inbound.request_id.to_string());
                if inbound.reply.send(response).is_err() {
                    debug!(request_id = %inbound.request_id, "Caller dropped before shutdown reply");
                }
            }
        }
    }
}

/// Run an entry or continuation, turning a panic into an `Internal` error.
fn guarded<F>(node: NodeId, name: &str, request_id: RequestId, f: F) -> Flow
where
    F: FnOnce() -> Flow,
{
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!(
            node_id = node,
            request_id = %request_id,
            middleware = %name,
            panic_message = %message,
            "Middleware panicked"
        );
        Flow::Fail(PipelineError::internal(format!(
            "middleware '{name}' panicked: {message}"
        )))
    })
}
