use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use super::NodeId;

/// Lifecycle state stored in a node slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum NodeState {
    Starting = 0,
    Running = 1,
    Restarting = 2,
    Terminated = 3,
}

impl NodeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => NodeState::Starting,
            1 => NodeState::Running,
            2 => NodeState::Restarting,
            _ => NodeState::Terminated,
        }
    }
}

/// Atomic cell holding a [`NodeState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: NodeState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: NodeState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to`; false if the cell held something else.
    pub(crate) fn transition(&self, from: NodeState, to: NodeState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Health of one dispatcher node as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// Thread spawned, loop not confirmed yet.
    Starting,
    /// Serving below the degraded threshold.
    Healthy,
    /// Serving, but at or above the in-flight threshold.
    Degraded,
    /// Exited abnormally; waiting out the restart backoff.
    Restarting,
    /// Stopped for good (shutdown or restart budget exhausted).
    Terminated,
}

impl NodeHealth {
    #[must_use]
    pub fn is_routable(self) -> bool {
        matches!(self, NodeHealth::Healthy | NodeHealth::Degraded)
    }
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub health: NodeHealth,
    pub in_flight: usize,
    /// Restarts over the node's lifetime.
    pub restarts: u32,
    /// Incremented every time the node's loop is (re)spawned.
    pub generation: u64,
}

/// Aggregated health of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterHealth {
    pub healthy: usize,
    pub degraded: usize,
    pub starting: usize,
    pub restarting: usize,
    pub terminated: usize,
    pub nodes: Vec<NodeStatus>,
}

impl ClusterHealth {
    pub(crate) fn from_nodes(nodes: Vec<NodeStatus>) -> Self {
        let mut health = ClusterHealth::default();
        for node in &nodes {
            match node.health {
                NodeHealth::Starting => health.starting += 1,
                NodeHealth::Healthy => health.healthy += 1,
                NodeHealth::Degraded => health.degraded += 1,
                NodeHealth::Restarting => health.restarting += 1,
                NodeHealth::Terminated => health.terminated += 1,
            }
        }
        health.nodes = nodes;
        health
    }

    /// Nodes that can take traffic (healthy or degraded).
    #[must_use]
    pub fn serving(&self) -> usize {
        self.healthy + self.degraded
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.nodes.len()
    }
}
