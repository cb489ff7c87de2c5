//! Layered configuration: built-in defaults, an optional TOML file, then
//! `CLAUDE_ORCH_*` environment overrides, matching the schema in the
//! external-interfaces section of the design.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigSource, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration. Fatal: the
/// process aborts at startup rather than run with an invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The layered `config` crate build/deserialize step failed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    /// A loaded value violates a documented constraint.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target number of agents to start.
    pub num_agents: usize,
    /// Minimum number of agents that must start successfully, else `start()`
    /// aborts with a resource error. Defaults to 1.
    pub min_agents: usize,
    /// Dispatcher thread/task pool size.
    pub max_workers: usize,
    /// Default per-task wall-clock budget, in seconds.
    pub task_timeout_secs: f64,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"`, `"debug"`.
    pub log_level: String,
    /// Per-agent container and health-check settings.
    pub agent: AgentSettings,
    /// Broker socket path, connect/message timeouts, and retry budget.
    pub communication: CommunicationSettings,
    /// Task queue capacity and priority-band count.
    pub task_queue: TaskQueueSettings,
    /// Isolated-workspace mode and environment catalogue.
    pub isolated_workspace: IsolatedWorkspaceSettings,
    /// Retry, parallelism, and snapshot-around-task policy.
    pub task_execution: TaskExecutionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_agents: 3,
            min_agents: 1,
            max_workers: 10,
            task_timeout_secs: 300.0,
            log_level: "info".to_string(),
            agent: AgentSettings::default(),
            communication: CommunicationSettings::default(),
            task_queue: TaskQueueSettings::default(),
            isolated_workspace: IsolatedWorkspaceSettings::default(),
            task_execution: TaskExecutionSettings::default(),
        }
    }
}

/// Per-agent container resource caps and health-probe cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Docker-shorthand memory cap, e.g. `"2g"`.
    pub container_memory: String,
    /// Fractional CPU core cap.
    pub container_cpu: String,
    /// Seconds between health probes.
    pub health_check_interval: u64,
    /// Consecutive probe failures before an agent is marked `failed`.
    pub health_check_failure_threshold: u32,
    /// Whether the Supervisor attempts one restart after an agent fails
    /// health checks before quarantining it.
    pub auto_restart: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            container_memory: "2g".to_string(),
            container_cpu: "1.0".to_string(),
            health_check_interval: 30,
            health_check_failure_threshold: 3,
            auto_restart: true,
        }
    }
}

/// Broker socket path and messaging timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationSettings {
    /// Unix-domain socket path the broker binds/connects to.
    pub socket_path: PathBuf,
    /// Seconds a `receive`/connect call may block before giving up.
    pub message_timeout_secs: f64,
    /// Retry attempts for a transient channel failure.
    pub retry_count: u32,
}

impl Default for CommunicationSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/claude_orchestrator.sock"),
            message_timeout_secs: 5.0,
            retry_count: 3,
        }
    }
}

/// Task queue capacity and priority-band count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueSettings {
    /// Maximum resident tasks before `enqueue` fails with `queue_full`.
    pub max_size: usize,
    /// Number of distinct priority levels (1..=this).
    pub priority_levels: u8,
}

impl Default for TaskQueueSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            priority_levels: 10,
        }
    }
}

/// Whether/how isolated workspaces are provisioned, and the environment
/// catalogue each agent can be started under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolatedWorkspaceSettings {
    /// Master switch; if false, agents run without container isolation
    /// (implementation-defined by the runtime chosen at construction time).
    pub enabled: bool,
    /// `sandbox` (fresh container per agent), `shared` (one shared
    /// container), or `hybrid`.
    pub mode: WorkspaceMode,
    /// Host directory each agent's workspace is rooted under.
    pub workspace_root: PathBuf,
    /// Named environment tags available to `create_workspace`.
    pub environments: std::collections::HashMap<String, crate::workspace::EnvironmentSpec>,
    /// Snapshots retained per agent before the oldest is pruned.
    pub snapshot_retention: usize,
}

impl Default for IsolatedWorkspaceSettings {
    fn default() -> Self {
        let mut environments = std::collections::HashMap::new();
        environments.insert(
            "default".to_string(),
            crate::workspace::EnvironmentSpec {
                image: "claude-worker:latest".to_string(),
                packages: Vec::new(),
                volumes: std::collections::HashMap::new(),
                memory: "2g".to_string(),
                cpu: "1.0".to_string(),
            },
        );
        Self {
            enabled: true,
            mode: WorkspaceMode::Sandbox,
            workspace_root: PathBuf::from("/tmp/claude_orchestrator/workspaces"),
            environments,
            snapshot_retention: 3,
        }
    }
}

/// Isolation strategy for agent workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    /// Every agent gets a fresh, fully isolated container.
    Sandbox,
    /// Agents share one container (no per-agent isolation).
    Shared,
    /// A mix, implementation-defined per environment tag.
    Hybrid,
}

/// Retry, parallelism, and snapshot-around-task execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExecutionSettings {
    /// Max retries for a task execution error (not a timeout).
    pub max_retries: u32,
    /// Seconds to wait between retries.
    pub retry_delay_secs: f64,
    /// Whether `execute_parallel_task` fans subtasks out concurrently (when
    /// false, subtasks still run sequentially on the chosen agents).
    pub parallel_execution: bool,
    /// Remove the agent's container on a task failure rather than reusing it.
    pub cleanup_on_failure: bool,
    /// Snapshot the workspace immediately before executing a task.
    pub snapshot_before_task: bool,
    /// Restore the pre-task snapshot if the task fails.
    pub restore_on_error: bool,
}

impl Default for TaskExecutionSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_secs: 1.0,
            parallel_execution: true,
            cleanup_on_failure: false,
            snapshot_before_task: false,
            restore_on_error: false,
        }
    }
}

/// Platform-standard config file location used when `--config` is not
/// given: `<config_dir>/claude-orchestrator/config.toml`. Returns `None`
/// if the platform's config directory can't be determined, or if nothing
/// lives at the conventional path yet.
pub fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("claude-orchestrator").join("config.toml");
    path.exists().then_some(path)
}

impl Config {
    /// Build the effective configuration: compiled-in [`Default`], layered
    /// with an optional TOML file (if `path` is given and exists) and then
    /// `CLAUDE_ORCH_*` environment variables (double-underscore separated
    /// for nested keys, e.g. `CLAUDE_ORCH_AGENT__CONTAINER_MEMORY`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = ConfigSource::try_from(&Self::default())?;
        let mut builder = ConfigSource::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(Environment::with_prefix("CLAUDE_ORCH").separator("__"));

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints not expressible in the type alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_agents == 0 {
            return Err(ConfigError::Invalid("num_agents must be at least 1".into()));
        }
        if self.min_agents > self.num_agents {
            return Err(ConfigError::Invalid(format!(
                "min_agents ({}) cannot exceed num_agents ({})",
                self.min_agents, self.num_agents
            )));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if !(1..=10).contains(&self.task_queue.priority_levels) {
            return Err(ConfigError::Invalid("task_queue.priority_levels must be 1-10".into()));
        }
        Ok(())
    }

    /// The default per-task timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.task_timeout_secs.max(0.0))
    }

    /// The broker message-receive timeout as a [`Duration`].
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.communication.message_timeout_secs.max(0.0))
    }
}
