//! # CLI Module
//!
//! Minimal control interface for running a dispatcher cluster by hand.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! Start a cluster running the demo chain and read requests from stdin:
//!
//! ```bash
//! brrtpipe serve --config config/config.yaml --nodes 4
//! ```
//!
//! Every input line is either a request, `METHOD PATH [BODY]`, or a control
//! line:
//!
//! - `:health` - cluster health as JSON
//! - `:metrics` - Prometheus text of the event counters
//! - `:kill <node>` - crash a node; the supervisor restarts it
//! - `:quit` - shut the cluster down and exit
//!
//! ```text
//! GET /work/50
//! {"node":0,"status":200,"request_id":"01J...","body":{"result":{"slept_ms":50},...}}
//! :kill 0
//! killed node 0
//! ```
//!
//! ### `check-config`
//!
//! Validate a YAML file and print the effective configuration:
//!
//! ```bash
//! brrtpipe check-config --config config/config.yaml
//! ```

mod commands;
mod demo;


pub use commands::{run_cli, Cli, Commands, InputLine};
pub use demo::demo_registry;
