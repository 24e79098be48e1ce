//! # Cluster Module
//!
//! Runs several independent dispatcher nodes behind one entry point.
//!
//! ## Overview
//!
//! [`ClusterSupervisor`] owns an arena of node slots indexed by [`NodeId`].
//! Each slot holds the node's current [`DispatcherHandle`](crate::dispatcher::DispatcherHandle),
//! its lifecycle state and its restart history. A watcher thread receives
//! readiness and exit notices from node threads:
//!
//! - an abnormal exit (kill or panic) puts the node in `Restarting` and
//!   schedules a respawn after `restart_backoff`
//! - more than `max_restarts_per_window` restarts within `restart_window`
//!   terminate the node for good
//! - a shutdown exit terminates the node
//!
//! Requests are routed round-robin over healthy nodes, falling back to
//! degraded ones (nodes whose in-flight count reached `degraded_in_flight`).
//!
//! ## Configuration
//!
//! - `BRRTP_NODES`: node count for the CLI (default: available cores)
//! - `BRRTP_RESTART_BACKOFF_MS`: delay before a restart (default: 100)
//! - `BRRTP_MAX_RESTARTS`: restarts allowed per window (default: 5)
//! - `BRRTP_RESTART_WINDOW_MS`: restart window (default: 60000)
//! - `BRRTP_DEGRADED_IN_FLIGHT`: degraded threshold (default: 1024)

mod config;
mod health;
mod supervisor;

/// Index of a node slot inside a cluster.
pub type NodeId = usize;

pub use config::ClusterConfig;
pub use health::{ClusterHealth, NodeHealth, NodeStatus};
pub use supervisor::ClusterSupervisor;
