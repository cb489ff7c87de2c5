//! `claude-orchestrator` CLI entry point.
//!
//! Loads configuration, starts the [`Supervisor`], and blocks until a
//! shutdown signal arrives. See the `claude_orchestrator` library for the
//! orchestration kernel itself.

use std::path::PathBuf;

use anyhow::{Context, Result};
use claude_orchestrator::config::default_config_path;
use claude_orchestrator::{Config, Supervisor};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Drives the orchestration kernel from the command line.
#[derive(Parser)]
#[command(name = "claude-orchestrator")]
#[command(version)]
#[command(about = "Multi-agent orchestration kernel for container-isolated Claude Code sessions")]
struct Cli {
    /// Path to a TOML configuration file, layered over the built-in defaults.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of agents to start, overriding configuration.
    #[arg(long)]
    agents: Option<usize>,

    /// Shorthand for `--log-level debug`.
    #[arg(long)]
    debug: bool,
}

fn init_tracing(log_level: &str, debug: bool) {
    let directive = if debug { "debug" } else { log_level };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).json().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(default_config_path);
    let mut config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    if let Some(agents) = cli.agents {
        config.num_agents = agents;
    }
    config.validate().context("invalid configuration")?;

    init_tracing(&config.log_level, cli.debug);

    tracing::info!(
        num_agents = config.num_agents,
        max_workers = config.max_workers,
        socket = %config.communication.socket_path.display(),
        "claude-orchestrator starting"
    );

    let supervisor = Supervisor::start(config).await.context("failed to start orchestrator")?;
    supervisor.run_until_signal().await;

    Ok(())
}
