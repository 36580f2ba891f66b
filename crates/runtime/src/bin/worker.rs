//! satswarm worker process.
//!
//! # Usage
//!
//! ```bash
//! # Start with a configuration file
//! satswarm-worker --config worker.toml
//!
//! # Override the listen address
//! satswarm-worker --config worker.toml --listen 0.0.0.0:7101
//! ```
//!
//! # Configuration
//!
//! ```toml
//! rank = 0
//! listen_addr = "127.0.0.1:7100"
//! seed = 42
//!
//! [[peers]]
//! rank = 0
//! address = "127.0.0.1:7100"
//!
//! [[peers]]
//! rank = 1
//! address = "127.0.0.1:7101"
//!
//! [worker]
//! load_factor = 0.95
//! balance_period = 5.0
//! balancer_mode = "event-driven"
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use satswarm_runtime::{RuntimeConfig, RuntimeRunner, SolverFactory};
use satswarm_solver::{PortfolioSolver, ScriptedSolver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// satswarm worker
///
/// Runs one fleet member: job hosting, placement routing, and cooperative
/// volume balancing.
#[derive(Parser, Debug)]
#[command(name = "satswarm-worker")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config {}", cli.config.display()))?;
    let mut config: RuntimeConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing config {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    // The portfolio back-end is pluggable; the bundled scripted solver keeps
    // the fleet runnable without a linked SAT engine.
    let factory: SolverFactory =
        Arc::new(|_job| Box::new(ScriptedSolver::new()) as Box<dyn PortfolioSolver>);

    let runner = RuntimeRunner::start(config, factory)
        .await
        .context("starting runtime")?;
    let exit_code = runner.run().await;
    std::process::exit(exit_code);
}
