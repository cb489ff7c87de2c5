//! Process-level lifecycle owner: starts the orchestrator and its agent
//! fleet, runs the periodic statistics-reporting loop, and drives orderly
//! shutdown on a signal or an explicit `stop()` call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::agent::AgentConfig;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::workspace::docker::DockerRuntime;
use crate::workspace::{ContainerRuntime, WorkspaceController};

const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Owns the [`Orchestrator`] and the background stats-reporting loop; the
/// single entry point `main.rs` drives.
pub struct Supervisor {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    stats_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build the container runtime named by configuration, open the
    /// broker, and start `config.num_agents` agents. Aborts (returns an
    /// error) if fewer than `config.min_agents` come up.
    pub async fn start(config: Config) -> Result<Self, OrchestratorError> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(
            DockerRuntime::connect().map_err(OrchestratorError::Container)?,
        );
        let workspace = Arc::new(WorkspaceController::new(
            runtime,
            config.isolated_workspace.environments.clone(),
            config.isolated_workspace.workspace_root.clone(),
            config.isolated_workspace.snapshot_retention,
        ));

        let orchestrator = Arc::new(
            Orchestrator::new(
                config.communication.socket_path.clone(),
                Duration::from_secs_f64(config.communication.message_timeout_secs.max(0.1)),
                config.max_workers,
                config.task_queue.max_size,
            )
            .await
            .map_err(|err| match err {
                crate::orchestrator::DispatchError::Channel(e) => OrchestratorError::Channel(e),
                crate::orchestrator::DispatchError::InsufficientAgents { started, requested, min_agents } => {
                    OrchestratorError::Resource(format!(
                        "only {started} of {requested} agents started (minimum {min_agents})"
                    ))
                }
            })?,
        );

        let configs: Vec<AgentConfig> = (0..config.num_agents)
            .map(|i| {
                AgentConfig::new(
                    format!("agent_{i:03}"),
                    "default",
                    &config.isolated_workspace.workspace_root,
                    vec!["claude".to_string(), "--headless".to_string()],
                )
            })
            .collect();

        orchestrator
            .start(
                workspace,
                configs,
                config.min_agents,
                Duration::from_secs(config.agent.health_check_interval),
                config.agent.health_check_failure_threshold,
            )
            .await
            .map_err(|err| match err {
                crate::orchestrator::DispatchError::Channel(e) => OrchestratorError::Channel(e),
                crate::orchestrator::DispatchError::InsufficientAgents { started, requested, min_agents } => {
                    OrchestratorError::Resource(format!(
                        "only {started} of {requested} agents started (minimum {min_agents})"
                    ))
                }
            })?;

        let supervisor = Self {
            config,
            orchestrator,
            stats_loop: tokio::sync::Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        };
        supervisor.spawn_stats_loop().await;
        Ok(supervisor)
    }

    async fn spawn_stats_loop(&self) {
        let orchestrator = self.orchestrator.clone();
        let shutting_down = self.shutting_down.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATS_REPORT_INTERVAL).await;
                if shutting_down.load(Ordering::Acquire) {
                    break;
                }
                let stats = orchestrator.statistics();
                info!(
                    tasks_completed = stats.tasks_completed(),
                    tasks_failed = stats.tasks_failed(),
                    average_execution_time = stats.average_execution_time(),
                    idle_agents = orchestrator.idle_agent_count().await,
                    total_agents = orchestrator.agent_count().await,
                    "supervisor: periodic statistics report"
                );
            }
        });
        self.stats_loop.lock().await.replace(handle);
    }

    /// Shared handle to the orchestrator, for submitting tasks or reading
    /// statistics/results from the CLI layer.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Effective configuration this supervisor was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Block until a shutdown signal is received (SIGTERM/SIGINT on Unix),
    /// then run [`stop`](Self::stop). Intended as the main task's final
    /// await in `main.rs`.
    pub async fn run_until_signal(&self) {
        wait_for_shutdown_signal().await;
        info!("supervisor: shutdown signal received");
        self.stop(Duration::from_secs(10)).await;
    }

    /// Orderly shutdown: stop accepting new work, drain the dispatcher up
    /// to `grace_period`, stop every agent, and close the broker.
    pub async fn stop(&self, grace_period: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        if let Some(handle) = self.stats_loop.lock().await.take() {
            handle.abort();
        }
        self.orchestrator.shutdown(grace_period).await;
        info!("supervisor: shutdown complete");
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return,
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
