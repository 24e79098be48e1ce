use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use http::Method;
use serde_json::json;
use tracing::{info, warn};

use super::demo::demo_registry;
use crate::cluster::{ClusterSupervisor, NodeId};
use crate::config::PipelineConfig;
use crate::dispatcher::{Pipeline, Request, Response};
use crate::logging::init_logging_with_config;
use crate::observe::{EventSink, MetricsSink, Observers, TracingSink};
use crate::runtime_config::RuntimeConfig;
use crate::worker_pool::WorkerPool;

/// Command-line interface for brrtpipe
#[derive(Parser)]
#[command(name = "brrtpipe")]
#[command(about = "Cooperative request pipeline with a supervised dispatcher cluster", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start a cluster running the demo chain and feed it requests from stdin
    ///
    /// Each input line is `METHOD PATH [BODY]`. Control lines:
    /// `:health`, `:metrics`, `:kill <node>`, `:quit`.
    Serve {
        /// YAML configuration file (defaults and BRRTP_* variables otherwise)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override `cluster.node_count`
        #[arg(short, long, env = "BRRTP_NODES")]
        nodes: Option<usize>,
    },
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// One parsed line of `serve` input.
#[derive(Debug)]
pub enum InputLine {
    Request(Request),
    Health,
    Metrics,
    Kill(NodeId),
    Quit,
    Blank,
}

impl InputLine {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(InputLine::Blank);
        }
        if let Some(control) = line.strip_prefix(':') {
            let mut parts = control.split_whitespace();
            return match (parts.next(), parts.next()) {
                (Some("health"), None) => Ok(InputLine::Health),
                (Some("metrics"), None) => Ok(InputLine::Metrics),
                (Some("quit"), None) => Ok(InputLine::Quit),
                (Some("kill"), Some(node)) => node
                    .parse()
                    .map(InputLine::Kill)
                    .map_err(|_| format!("invalid node id: {node}")),
                _ => Err(format!("unknown control line: {line}")),
            };
        }

        let mut parts = line.splitn(3, ' ');
        let method = parts.next().unwrap_or_default();
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid method: {method}"))?;
        let path = match parts.next() {
            Some(p) if p.starts_with('/') => p,
            Some(p) => return Err(format!("path must start with '/': {p}")),
            None => return Err("missing path".to_string()),
        };
        let mut request = Request::new(method, path);
        if let Some(body) = parts.next() {
            request = request.with_body(body.trim().as_bytes().to_vec());
        }
        Ok(InputLine::Request(request))
    }
}

pub fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, nodes } => serve(config, nodes),
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => {
            let config = PipelineConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = PipelineConfig::load(path)?;
    println!("{}", config.to_yaml()?);
    println!("configuration OK: {}", path.display());
    Ok(())
}

fn serve(config_path: Option<PathBuf>, nodes: Option<usize>) -> anyhow::Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    if let Some(nodes) = nodes {
        config.cluster.node_count = nodes;
    }
    config.validate()?;

    let _log_guard = init_logging_with_config(&config.logging.clone().merge_env())?;
    RuntimeConfig::from_env().apply();

    let pool = Arc::new(WorkerPool::new("demo", config.workers.clone())?);
    let metrics = Arc::new(MetricsSink::new());
    let observers = Observers::new(vec![
        Arc::new(TracingSink) as Arc<dyn EventSink>,
        Arc::clone(&metrics) as Arc<dyn EventSink>,
    ]);
    let pipeline = Pipeline::new(demo_registry()?)
        .with_app(config.app_scope())
        .with_pool(Arc::clone(&pool))
        .with_observers(observers)
        .with_config(config.dispatcher.clone());

    let supervisor = ClusterSupervisor::new(pipeline, config.cluster.clone());
    supervisor
        .start(config.cluster.node_count)
        .context("failed to start dispatcher cluster")?;
    info!(nodes = config.cluster.node_count, "Serving requests from stdin");

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        match InputLine::parse(&line) {
            Ok(InputLine::Blank) => {}
            Ok(InputLine::Quit) => break,
            Ok(InputLine::Health) => {
                writeln!(stdout, "{}", serde_json::to_string(&supervisor.health())?)?;
            }
            Ok(InputLine::Metrics) => {
                write!(stdout, "{}", metrics.render_prometheus())?;
                writeln!(
                    stdout,
                    "brrtpipe_pool_shed_total {}\nbrrtpipe_pool_queue_depth {}",
                    pool.metrics().get_shed_count(),
                    pool.metrics().get_queue_depth()
                )?;
            }
            Ok(InputLine::Kill(node)) => match supervisor.kill(node) {
                Ok(()) => writeln!(stdout, "killed node {node}")?,
                Err(e) => writeln!(stdout, "error: {e}")?,
            },
            Ok(InputLine::Request(request)) => match supervisor.route(request) {
                Ok((node, pending)) => match pending.wait() {
                    Ok(response) => writeln!(stdout, "{}", render_response(node, &response))?,
                    Err(e) => writeln!(stdout, "error: node {node}: {e}")?,
                },
                Err(e) => writeln!(stdout, "error: {e}")?,
            },
            Err(e) => {
                warn!(input = %line, "Rejected input line");
                writeln!(stdout, "error: {e}")?;
            }
        }
        stdout.flush()?;
    }

    supervisor.shutdown();
    pool.shutdown();
    Ok(())
}

fn render_response(node: NodeId, response: &Response) -> String {
    let body = response
        .body_json()
        .unwrap_or_else(|| json!(response.body_str()));
    json!({
        "node": node,
        "status": response.status,
        "request_id": response.get_header("x-request-id"),
        "body": body,
    })
    .to_string()
}
