use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, warn};

use super::config::ClusterConfig;
use super::health::{ClusterHealth, NodeHealth, NodeState, NodeStatus, StateCell};
use super::NodeId;
use crate::dispatcher::{
    Dispatcher, DispatcherExit, DispatcherHandle, PendingResponse, Pipeline, Request, Response,
};
use crate::error::{panic_message, ClusterError};
use crate::observe::PipelineEvent;

/// Idle wake-up of the watcher when no restart is scheduled.
const WATCH_TICK: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum NodeExit {
    Stopped(DispatcherExit),
    Panicked(String),
}

impl NodeExit {
    fn wants_restart(&self) -> bool {
        !matches!(self, NodeExit::Stopped(DispatcherExit::Shutdown))
    }
}

enum SupervisorEvent {
    Ready {
        node: NodeId,
        generation: u64,
    },
    Exited {
        node: NodeId,
        generation: u64,
        exit: NodeExit,
    },
    Stop,
}

/// Sends `Exited` when the node thread ends, however it ends.
struct ExitNotice {
    events: mpsc::Sender<SupervisorEvent>,
    node: NodeId,
    generation: u64,
    exit: Option<NodeExit>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let exit = self
            .exit
            .take()
            .unwrap_or_else(|| NodeExit::Panicked("node thread unwound".to_string()));
        let event = SupervisorEvent::Exited {
            node: self.node,
            generation: self.generation,
            exit,
        };
        if self.events.send(event).is_err() {
            debug!(node_id = self.node, "Supervisor gone before node exit was reported");
        }
    }
}

/// One entry of the node arena.
struct NodeSlot {
    id: NodeId,
    state: StateCell,
    handle: ArcSwapOption<DispatcherHandle>,
    generation: AtomicU64,
    restarts: AtomicU32,
    recent_restarts: Mutex<VecDeque<Instant>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NodeSlot {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            state: StateCell::new(NodeState::Starting),
            handle: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
            recent_restarts: Mutex::new(VecDeque::new()),
            thread: Mutex::new(None),
        }
    }

    fn in_flight(&self) -> usize {
        self.handle.load().as_ref().map_or(0, |h| h.in_flight())
    }

    fn health(&self, degraded_in_flight: usize) -> NodeHealth {
        match self.state.get() {
            NodeState::Starting => NodeHealth::Starting,
            NodeState::Restarting => NodeHealth::Restarting,
            NodeState::Terminated => NodeHealth::Terminated,
            NodeState::Running if self.in_flight() >= degraded_in_flight => NodeHealth::Degraded,
            NodeState::Running => NodeHealth::Healthy,
        }
    }

    fn status(&self, degraded_in_flight: usize) -> NodeStatus {
        NodeStatus {
            id: self.id,
            health: self.health(degraded_in_flight),
            in_flight: self.in_flight(),
            restarts: self.restarts.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    fn take_thread(&self) -> Option<JoinHandle<()>> {
        lock(&self.thread).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ClusterInner {
    pipeline: Pipeline,
    config: ClusterConfig,
    nodes: OnceLock<Box<[Arc<NodeSlot>]>>,
    cursor: AtomicUsize,
    stopping: AtomicBool,
    events: Mutex<Option<mpsc::Sender<SupervisorEvent>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    watcher_started: AtomicBool,
    receiver: Mutex<Option<mpsc::Receiver<SupervisorEvent>>>,
}

/// Runs N dispatcher nodes, routes requests across them and restarts nodes
/// that exit abnormally.
///
/// Every node gets its own loop thread and shares the registry, application
/// scope and worker pool of the [`Pipeline`]. A failure in one node never
/// touches the requests of another.
///
/// ```rust,ignore
/// let supervisor = ClusterSupervisor::new(pipeline, ClusterConfig::default());
/// supervisor.start(4)?;
/// let response = supervisor.dispatch(Request::get("/health"))?;
/// ```
pub struct ClusterSupervisor {
    inner: Arc<ClusterInner>,
}

impl ClusterSupervisor {
    #[must_use]
    pub fn new(pipeline: Pipeline, config: ClusterConfig) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inner: Arc::new(ClusterInner {
                pipeline,
                config,
                nodes: OnceLock::new(),
                cursor: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                events: Mutex::new(Some(tx)),
                watcher: Mutex::new(None),
                watcher_started: AtomicBool::new(false),
                receiver: Mutex::new(Some(rx)),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Freeze the registry and spawn `nodes` dispatcher nodes plus the
    /// watcher.
    ///
    /// # Errors
    ///
    /// * [`ClusterError::NoNodes`] - `nodes` is zero
    /// * [`ClusterError::InvalidConfig`] - the [`ClusterConfig`] fails validation
    /// * [`ClusterError::AlreadyStarted`] - called twice
    /// * [`ClusterError::Spawn`] - a node thread could not be created
    pub fn start(&self, nodes: usize) -> Result<(), ClusterError> {
        if nodes == 0 {
            return Err(ClusterError::NoNodes);
        }
        self.inner.config.validate()?;
        let slots: Box<[Arc<NodeSlot>]> =
            (0..nodes).map(|id| Arc::new(NodeSlot::new(id))).collect();
        if self.inner.nodes.set(slots).is_err() {
            return Err(ClusterError::AlreadyStarted);
        }
        self.inner.pipeline.registry.freeze();

        info!(
            nodes = nodes,
            restart_backoff_ms = self.inner.config.restart_backoff.as_millis() as u64,
            max_restarts_per_window = self.inner.config.max_restarts_per_window,
            "Starting dispatcher cluster"
        );

        for slot in self.inner.slots() {
            spawn_node(&self.inner, slot)?;
        }
        self.watch()
    }

    /// Start the watcher thread that restarts crashed nodes. Idempotent.
    pub fn watch(&self) -> Result<(), ClusterError> {
        if self.inner.nodes.get().is_none() {
            return Err(ClusterError::NotStarted);
        }
        if self.inner.watcher_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(receiver) = lock(&self.inner.receiver).take() else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        let join = std::thread::Builder::new()
            .name("brrtpipe-supervisor".to_string())
            .spawn(move || watch_loop(&inner, &receiver))?;
        *lock(&self.inner.watcher) = Some(join);
        Ok(())
    }

    /// Pick a node round-robin, preferring healthy nodes over degraded ones.
    fn pick(&self) -> Result<(NodeId, Arc<DispatcherHandle>), ClusterError> {
        let slots = self.inner.nodes.get().ok_or(ClusterError::NotStarted)?;
        let threshold = self.inner.config.degraded_in_flight;
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        let len = slots.len();

        let mut fallback = None;
        for i in 0..len {
            let slot = &slots[(start + i) % len];
            let health = slot.health(threshold);
            if !health.is_routable() {
                continue;
            }
            let Some(handle) = slot.handle.load_full() else {
                continue;
            };
            if health == NodeHealth::Healthy {
                return Ok((slot.id, handle));
            }
            if fallback.is_none() {
                fallback = Some((slot.id, handle));
            }
        }
        fallback.ok_or(ClusterError::NoHealthyNodes)
    }

    /// Route a request to a node without waiting for the response.
    pub fn route(&self, request: Request) -> Result<(NodeId, PendingResponse), ClusterError> {
        let (node, handle) = self.pick()?;
        let pending = handle
            .submit(request)
            .map_err(|_| ClusterError::NodeLost(node))?;
        debug!(node_id = node, request_id = %pending.request_id(), "Request routed");
        Ok((node, pending))
    }

    /// Route a request and block until its response arrives.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NodeLost`] if the chosen node died before answering.
    pub fn dispatch(&self, request: Request) -> Result<Response, ClusterError> {
        let (node, pending) = self.route(request)?;
        pending.wait().map_err(|_| ClusterError::NodeLost(node))
    }

    #[must_use]
    pub fn health(&self) -> ClusterHealth {
        let threshold = self.inner.config.degraded_in_flight;
        let nodes = self
            .inner
            .slots()
            .iter()
            .map(|slot| slot.status(threshold))
            .collect();
        ClusterHealth::from_nodes(nodes)
    }

    /// Crash a node on purpose. Its in-flight requests are lost and the
    /// watcher restarts it after the backoff.
    pub fn kill(&self, node: NodeId) -> Result<(), ClusterError> {
        let slots = self.inner.nodes.get().ok_or(ClusterError::NotStarted)?;
        let slot = slots.get(node).ok_or(ClusterError::UnknownNode(node))?;
        if !slot.state.transition(NodeState::Running, NodeState::Restarting)
            && !slot.state.transition(NodeState::Starting, NodeState::Restarting)
        {
            debug!(node_id = node, "Kill ignored: node is not running");
            return Ok(());
        }
        warn!(node_id = node, "Killing dispatcher node");
        if let Some(handle) = slot.handle.load_full() {
            handle.kill();
        }
        Ok(())
    }

    /// Stop the watcher, shut every node down and wait for their threads.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down dispatcher cluster");

        if let Some(events) = lock(&self.inner.events).take() {
            if events.send(SupervisorEvent::Stop).is_err() {
                debug!("Supervisor watcher already stopped");
            }
        }
        if let Some(join) = lock(&self.inner.watcher).take() {
            if join.join().is_err() {
                error!("Supervisor watcher panicked");
            }
        }

        for slot in self.inner.slots() {
            if let Some(handle) = slot.handle.load_full() {
                handle.shutdown();
            }
        }
        for slot in self.inner.slots() {
            if let Some(join) = slot.take_thread() {
                if join.join().is_err() {
                    error!(node_id = slot.id, "Node thread panicked during shutdown");
                }
            }
            slot.state.set(NodeState::Terminated);
        }
        info!("Dispatcher cluster stopped");
    }
}

impl Drop for ClusterSupervisor {
    fn drop(&mut self) {
        if self.inner.nodes.get().is_some() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ClusterSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSupervisor")
            .field("config", &self.inner.config)
            .field("nodes", &self.inner.slots().len())
            .finish()
    }
}

impl ClusterInner {
    fn slots(&self) -> &[Arc<NodeSlot>] {
        match self.nodes.get() {
            Some(slots) => slots,
            None => &[],
        }
    }

    fn events(&self) -> Option<mpsc::Sender<SupervisorEvent>> {
        lock(&self.events).clone()
    }
}

/// Spawn a fresh dispatcher loop for `slot` on its own thread.
fn spawn_node(inner: &ClusterInner, slot: &Arc<NodeSlot>) -> Result<(), ClusterError> {
    let Some(events) = inner.events() else {
        return Err(ClusterError::NotStarted);
    };
    let node = slot.id;
    let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let (dispatcher, handle) = Dispatcher::new(node, inner.pipeline.clone());
    slot.handle.store(Some(Arc::new(handle)));

    let join = std::thread::Builder::new()
        .name(format!("brrtpipe-node-{node}"))
        .spawn(move || {
            let mut notice = ExitNotice {
                events,
                node,
                generation,
                exit: None,
            };
            if notice
                .events
                .send(SupervisorEvent::Ready { node, generation })
                .is_err()
            {
                debug!(node_id = node, "Supervisor gone before node became ready");
            }
            notice.exit = Some(match catch_unwind(AssertUnwindSafe(move || dispatcher.run())) {
                Ok(exit) => NodeExit::Stopped(exit),
                Err(panic) => NodeExit::Panicked(panic_message(panic.as_ref())),
            });
        })?;

    if let Some(previous) = lock(&slot.thread).replace(join) {
        // the previous generation already reported its exit
        if previous.join().is_err() {
            debug!(node_id = node, "Previous node thread ended in a panic");
        }
    }
    debug!(node_id = node, generation = generation, "Node thread spawned");
    Ok(())
}

fn watch_loop(inner: &Arc<ClusterInner>, events: &mpsc::Receiver<SupervisorEvent>) {
    info!("Supervisor watcher started");
    let mut scheduled: Vec<(Instant, NodeId)> = Vec::new();

    loop {
        let wait = scheduled
            .iter()
            .map(|(due, _)| due.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(WATCH_TICK);

        match events.recv_timeout(wait) {
            Ok(SupervisorEvent::Ready { node, generation }) => on_ready(inner, node, generation),
            Ok(SupervisorEvent::Exited {
                node,
                generation,
                exit,
            }) => {
                if let Some(due) = on_exit(inner, node, generation, &exit) {
                    scheduled.push((due, node));
                }
            }
            Ok(SupervisorEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = scheduled.into_iter().partition(|(at, _)| *at <= now);
        scheduled = later;
        for (_, node) in due {
            restart(inner, node);
        }
    }
    info!("Supervisor watcher stopped");
}

fn on_ready(inner: &ClusterInner, node: NodeId, generation: u64) {
    let Some(slot) = inner.slots().get(node) else {
        return;
    };
    if slot.generation.load(Ordering::Acquire) != generation {
        return;
    }
    if slot.state.transition(NodeState::Starting, NodeState::Running) {
        info!(node_id = node, generation = generation, "Node ready");
    }
}

/// Record an exit; returns when to restart the node, if at all.
fn on_exit(
    inner: &ClusterInner,
    node: NodeId,
    generation: u64,
    exit: &NodeExit,
) -> Option<Instant> {
    let slot = inner.slots().get(node)?;
    if slot.generation.load(Ordering::Acquire) != generation {
        return None;
    }
    if inner.stopping.load(Ordering::Acquire) || !exit.wants_restart() {
        info!(node_id = node, exit = ?exit, "Node stopped");
        slot.state.set(NodeState::Terminated);
        return None;
    }

    error!(node_id = node, generation = generation, exit = ?exit, "Node exited abnormally");

    let config = &inner.config;
    let now = Instant::now();
    let mut recent = lock(&slot.recent_restarts);
    while recent
        .front()
        .is_some_and(|at| now.duration_since(*at) > config.restart_window)
    {
        recent.pop_front();
    }
    if recent.len() >= config.max_restarts_per_window as usize {
        error!(
            node_id = node,
            restarts_in_window = recent.len(),
            window_ms = config.restart_window.as_millis() as u64,
            "Restart budget exhausted - terminating node"
        );
        slot.state.set(NodeState::Terminated);
        return None;
    }
    recent.push_back(now);
    slot.state.set(NodeState::Restarting);
    Some(now + config.restart_backoff)
}

fn restart(inner: &ClusterInner, node: NodeId) {
    if inner.stopping.load(Ordering::Acquire) {
        return;
    }
    let Some(slot) = inner.slots().get(node) else {
        return;
    };
    if !slot.state.transition(NodeState::Restarting, NodeState::Starting) {
        return;
    }
    match spawn_node(inner, slot) {
        Ok(()) => {
            let restarts = slot.restarts.fetch_add(1, Ordering::AcqRel) + 1;
            inner.pipeline.observers.emit(&PipelineEvent::NodeRestarted { node, restarts });
            info!(node_id = node, restarts = restarts, "Node restarted");
        }
        Err(e) => {
            error!(node_id = node, error = %e, "Failed to restart node");
            slot.state.set(NodeState::Terminated);
        }
    }
}
