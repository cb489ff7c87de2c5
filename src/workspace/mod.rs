//! Per-agent isolated container provisioning, exec, and snapshot/restore.
//!
//! The controller never talks to a container CLI; it drives an abstract
//! [`ContainerRuntime`] (the Docker Engine API over its Unix socket in
//! production, an in-memory fake under `test-utils`) so the rest of the
//! kernel can be exercised without a live daemon.

pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::resilience::{with_backoff, BackoffPolicy, CircuitBreaker};

/// Errors raised by the workspace controller or its [`ContainerRuntime`].
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The container runtime rejected a create/start/exec/commit call.
    #[error("container error ({operation}): {message}")]
    Container {
        /// The operation being attempted (`create`, `exec`, `commit`, ...).
        operation: &'static str,
        /// Runtime-supplied failure description.
        message: String,
        /// Exit code, when the failure is a non-zero process exit.
        exit_code: Option<i64>,
    },
    /// `restore_snapshot` named a snapshot this agent never created.
    #[error("snapshot {name} not found for agent {agent_id}")]
    SnapshotNotFound {
        /// The agent the snapshot was requested for.
        agent_id: String,
        /// The unknown snapshot name.
        name: String,
    },
    /// `environment_tag` has no corresponding entry in configuration.
    #[error("unknown environment tag: {0}")]
    UnknownEnvironment(String),
    /// Host workspace directory could not be created.
    #[error("failed to prepare host workspace dir {path}: {source}")]
    HostDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The runtime circuit breaker is open after repeated failures; the call
    /// was rejected without reaching the container runtime.
    #[error("container runtime circuit open, rejecting {operation}")]
    CircuitOpen {
        /// The operation that was rejected (`provision`, `exec`, `spawn`).
        operation: &'static str,
    },
}

/// An environment tag's declared image, package list, and volume map, as
/// named in `isolated_workspace` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Container base image.
    pub image: String,
    /// Packages expected to be preinstalled in the image (documentation
    /// only; the controller does not install them at runtime).
    #[serde(default)]
    pub packages: Vec<String>,
    /// Extra named volumes beyond the workspace bind mount, guest path keyed.
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    /// Memory cap, Docker-style shorthand (`"2g"`).
    #[serde(default = "default_memory")]
    pub memory: String,
    /// CPU cap, fractional cores.
    #[serde(default = "default_cpu")]
    pub cpu: String,
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpu() -> String {
    "1.0".to_string()
}

/// Host-side description of how to provision one agent's container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Conventional container name, e.g. `claude-agent-000`.
    pub name: String,
    /// Base image to start from (the environment's image, or a snapshot tag
    /// on restore).
    pub image: String,
    /// Host directory bind-mounted into the guest workspace path.
    pub host_workspace: PathBuf,
    /// Guest-side mount point (conventionally `/workspace`).
    pub guest_workspace: String,
    /// Extra named volumes (guest path keyed).
    pub volumes: HashMap<String, String>,
    /// Memory cap.
    pub memory: String,
    /// CPU cap.
    pub cpu: String,
}

/// Lifecycle status of a [`WorkspaceContainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Created but the main process has not been observed live yet.
    Created,
    /// The main process is live.
    Running,
    /// Stopped (by `cleanup` or an external signal).
    Stopped,
}

/// A provisioned per-agent container, as tracked by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceContainer {
    /// Runtime-assigned container id.
    pub container_id: String,
    /// The spec it was created from (image, caps, mounts), minus volumes
    /// (kept out of the persisted view; available via the controller).
    pub container_name: String,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// Host-side workspace directory bound into the guest.
    pub workspace_path: PathBuf,
}

/// Output of a synchronous [`ContainerRuntime::exec`] call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i64,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// A long-lived attached process inside a container, used by the agent
/// runtime to drive the worker binary's stdin/stdout/stderr.
///
/// Methods take `&self` (implementations use interior mutability) so the
/// agent runtime can run independent stdout- and stderr-draining loops
/// concurrently with writes, matching the startup sequence's "two reader
/// loops plus a single writer" shape.
#[async_trait]
pub trait AttachedProcess: Send + Sync {
    /// Write one line (with trailing newline) to the process's stdin.
    async fn write_line(&self, line: &str) -> Result<(), WorkspaceError>;
    /// Read the next complete stdout line, or `None` on EOF.
    async fn read_stdout_line(&self) -> Result<Option<String>, WorkspaceError>;
    /// Read the next complete stderr line, or `None` on EOF.
    async fn read_stderr_line(&self) -> Result<Option<String>, WorkspaceError>;
    /// Ask the process to exit gracefully.
    async fn terminate(&self) -> Result<(), WorkspaceError>;
    /// Forcibly end the process.
    async fn kill(&self) -> Result<(), WorkspaceError>;
}

/// Abstraction over the container runtime the controller drives. Production
/// code talks to the Docker Engine API (`docker::DockerRuntime`); tests use
/// an in-memory fake (`mock::MockRuntime`, under `test-utils`).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container per `spec`.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, WorkspaceError>;
    /// Start a previously created container.
    async fn start_container(&self, container_id: &str) -> Result<(), WorkspaceError>;
    /// Whether the container's main process is currently live.
    async fn is_running(&self, container_id: &str) -> Result<bool, WorkspaceError>;
    /// Stop a running container.
    async fn stop_container(&self, container_id: &str) -> Result<(), WorkspaceError>;
    /// Remove a stopped container.
    async fn remove_container(&self, container_id: &str) -> Result<(), WorkspaceError>;
    /// Run `command` inside the container to completion, bounded by `deadline`.
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        deadline: Duration,
    ) -> Result<ExecOutput, WorkspaceError>;
    /// Launch `command` inside the container with attached stdio, for a
    /// long-lived process the caller drives interactively.
    async fn spawn_attached(
        &self,
        container_id: &str,
        command: &[String],
    ) -> Result<Box<dyn AttachedProcess>, WorkspaceError>;
    /// Commit the container's filesystem to an image tagged `image_tag`.
    async fn commit(&self, container_id: &str, image_tag: &str) -> Result<(), WorkspaceError>;
    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> Result<(), WorkspaceError>;
}

struct AgentEntry {
    container: WorkspaceContainer,
    environment_tag: String,
    snapshots: Vec<String>,
}

/// Provisions, execs into, snapshots, and tears down per-agent containers.
pub struct WorkspaceController {
    runtime: std::sync::Arc<dyn ContainerRuntime>,
    environments: HashMap<String, EnvironmentSpec>,
    workspace_root: PathBuf,
    guest_workspace: String,
    agents: Mutex<HashMap<String, AgentEntry>>,
    retry_policy: BackoffPolicy,
    snapshot_retention: usize,
    runtime_breaker: CircuitBreaker,
}

impl std::fmt::Debug for WorkspaceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceController")
            .field("workspace_root", &self.workspace_root)
            .field("environments", &self.environments.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn container_name(agent_id: &str) -> String {
    format!("claude-agent-{agent_id}")
}

impl WorkspaceController {
    /// Construct a controller over `runtime`, rooted at `workspace_root` on
    /// the host, with the given environment catalogue and snapshot
    /// retention (per-agent count beyond which the oldest is dropped).
    pub fn new(
        runtime: std::sync::Arc<dyn ContainerRuntime>,
        environments: HashMap<String, EnvironmentSpec>,
        workspace_root: PathBuf,
        snapshot_retention: usize,
    ) -> Self {
        Self {
            runtime,
            environments,
            workspace_root,
            guest_workspace: "/workspace".to_string(),
            agents: Mutex::new(HashMap::new()),
            retry_policy: BackoffPolicy::default(),
            snapshot_retention,
            runtime_breaker: CircuitBreaker::new(3, Duration::from_secs(30)),
        }
    }

    /// Run `fut` if the runtime circuit breaker is closed/half-open,
    /// recording the outcome. Rejects outright while open, so repeated
    /// container-runtime failures stop hammering a dependency that's down.
    async fn through_breaker<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, WorkspaceError>
    where
        Fut: std::future::Future<Output = Result<T, WorkspaceError>>,
    {
        if !self.runtime_breaker.allow_call() {
            warn!(operation, "workspace: circuit open, rejecting call to container runtime");
            return Err(WorkspaceError::CircuitOpen { operation });
        }
        match fut.await {
            Ok(value) => {
                self.runtime_breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                self.runtime_breaker.record_failure();
                Err(err)
            }
        }
    }

    fn host_workspace(&self, agent_id: &str) -> PathBuf {
        self.workspace_root.join(agent_id)
    }

    /// Create (idempotently) the container for `agent_id` under
    /// `environment_tag`. Any existing container of the same conventional
    /// name is removed first. On any failure after container creation, the
    /// partially-created container is removed before the error propagates.
    #[instrument(skip(self), fields(agent_id))]
    pub async fn create_workspace(
        &self,
        agent_id: &str,
        environment_tag: &str,
    ) -> Result<WorkspaceContainer, WorkspaceError> {
        let env = self
            .environments
            .get(environment_tag)
            .ok_or_else(|| WorkspaceError::UnknownEnvironment(environment_tag.to_string()))?
            .clone();

        let host_workspace = self.host_workspace(agent_id);
        std::fs::create_dir_all(&host_workspace)
            .map_err(|source| WorkspaceError::HostDir { path: host_workspace.clone(), source })?;

        self.remove_existing(agent_id).await;

        let spec = ContainerSpec {
            name: container_name(agent_id),
            image: env.image.clone(),
            host_workspace: host_workspace.clone(),
            guest_workspace: self.guest_workspace.clone(),
            volumes: env.volumes.clone(),
            memory: env.memory.clone(),
            cpu: env.cpu.clone(),
        };

        let result = self.provision(&spec).await;
        let container_id = match result {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "workspace: provisioning failed, no partial container retained");
                return Err(err);
            }
        };

        let container = WorkspaceContainer {
            container_id,
            container_name: spec.name.clone(),
            created_at: Utc::now(),
            status: ContainerStatus::Running,
            workspace_path: host_workspace,
        };

        self.agents.lock().await.insert(
            agent_id.to_string(),
            AgentEntry {
                container: container.clone(),
                environment_tag: environment_tag.to_string(),
                snapshots: Vec::new(),
            },
        );

        info!(container_id = %container.container_id, "workspace: container running");
        Ok(container)
    }

    async fn provision(&self, spec: &ContainerSpec) -> Result<String, WorkspaceError> {
        self.through_breaker("provision", self.do_provision(spec)).await
    }

    async fn do_provision(&self, spec: &ContainerSpec) -> Result<String, WorkspaceError> {
        let runtime = self.runtime.clone();
        let create_spec = spec.clone();
        let container_id = with_backoff(self.retry_policy, move || {
            let runtime = runtime.clone();
            let spec = create_spec.clone();
            async move { runtime.create_container(&spec).await }
        })
        .await;

        let container_id = match container_id {
            Ok(id) => id,
            Err(err) => return Err(err),
        };

        if let Err(err) = self.runtime.start_container(&container_id).await {
            let _ = self.runtime.remove_container(&container_id).await;
            return Err(err);
        }
        if !self.runtime.is_running(&container_id).await.unwrap_or(false) {
            let _ = self.runtime.remove_container(&container_id).await;
            return Err(WorkspaceError::Container {
                operation: "start",
                message: format!("container {container_id} did not reach running state"),
                exit_code: None,
            });
        }
        Ok(container_id)
    }

    async fn remove_existing(&self, agent_id: &str) {
        let existing = self.agents.lock().await.remove(agent_id);
        if let Some(entry) = existing {
            let _ = self.runtime.stop_container(&entry.container.container_id).await;
            let _ = self.runtime.remove_container(&entry.container.container_id).await;
        }
    }

    /// Run `command` inside `agent_id`'s container, bounded by `deadline`.
    /// Never raises on a non-zero exit; the exit code is returned verbatim.
    pub async fn exec(
        &self,
        agent_id: &str,
        command: &[String],
        deadline: Duration,
    ) -> Result<ExecOutput, WorkspaceError> {
        let container_id = self.container_id(agent_id).await?;
        self.through_breaker("exec", self.runtime.exec(&container_id, command, deadline)).await
    }

    /// Launch `command` with attached stdio inside `agent_id`'s container.
    pub async fn spawn_attached(
        &self,
        agent_id: &str,
        command: &[String],
    ) -> Result<Box<dyn AttachedProcess>, WorkspaceError> {
        let container_id = self.container_id(agent_id).await?;
        self.through_breaker("spawn", self.runtime.spawn_attached(&container_id, command)).await
    }

    async fn container_id(&self, agent_id: &str) -> Result<String, WorkspaceError> {
        self.agents
            .lock()
            .await
            .get(agent_id)
            .map(|e| e.container.container_id.clone())
            .ok_or_else(|| WorkspaceError::Container {
                operation: "lookup",
                message: format!("no container provisioned for agent {agent_id}"),
                exit_code: None,
            })
    }

    /// Commit `agent_id`'s container filesystem to a named, restorable
    /// snapshot image. Defaults the name to a timestamp when unset.
    pub async fn create_snapshot(&self, agent_id: &str, name: Option<String>) -> Result<String, WorkspaceError> {
        let container_id = self.container_id(agent_id).await?;
        let name = name.unwrap_or_else(|| format!("snapshot-{}", Utc::now().format("%Y%m%d%H%M%S%3f")));
        let tag = snapshot_tag(agent_id, &name);
        self.runtime.commit(&container_id, &tag).await?;

        let mut agents = self.agents.lock().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.snapshots.push(name.clone());
            while entry.snapshots.len() > self.snapshot_retention {
                entry.snapshots.remove(0);
            }
        }
        Ok(name)
    }

    /// Stop and remove the current container, then start a fresh one from
    /// the named snapshot image, preserving the host workspace directory.
    pub async fn restore_snapshot(&self, agent_id: &str, name: &str) -> Result<WorkspaceContainer, WorkspaceError> {
        let (environment_tag, known) = {
            let agents = self.agents.lock().await;
            let entry = agents.get(agent_id).ok_or_else(|| WorkspaceError::SnapshotNotFound {
                agent_id: agent_id.to_string(),
                name: name.to_string(),
            })?;
            (entry.environment_tag.clone(), entry.snapshots.contains(&name.to_string()))
        };
        if !known {
            return Err(WorkspaceError::SnapshotNotFound { agent_id: agent_id.to_string(), name: name.to_string() });
        }

        let env = self
            .environments
            .get(&environment_tag)
            .ok_or_else(|| WorkspaceError::UnknownEnvironment(environment_tag.clone()))?
            .clone();

        self.remove_existing(agent_id).await;

        let spec = ContainerSpec {
            name: container_name(agent_id),
            image: snapshot_tag(agent_id, name),
            host_workspace: self.host_workspace(agent_id),
            guest_workspace: self.guest_workspace.clone(),
            volumes: env.volumes.clone(),
            memory: env.memory.clone(),
            cpu: env.cpu.clone(),
        };
        let container_id = self.provision(&spec).await?;
        let container = WorkspaceContainer {
            container_id,
            container_name: spec.name.clone(),
            created_at: Utc::now(),
            status: ContainerStatus::Running,
            workspace_path: spec.host_workspace.clone(),
        };

        let mut agents = self.agents.lock().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.container = container.clone();
        }
        Ok(container)
    }

    /// Stop and remove `agent_id`'s container, optionally preserving its
    /// named volumes. Always safe to call on an already-stopped agent.
    pub async fn cleanup(&self, agent_id: &str, preserve_volumes: bool) -> Result<(), WorkspaceError> {
        let entry = self.agents.lock().await.remove(agent_id);
        let Some(entry) = entry else { return Ok(()) };

        let _ = self.runtime.stop_container(&entry.container.container_id).await;
        self.runtime.remove_container(&entry.container.container_id).await?;

        if !preserve_volumes {
            if let Some(env) = self.environments.get(&entry.environment_tag) {
                for volume in env.volumes.keys() {
                    let _ = self.runtime.remove_volume(volume).await;
                }
            }
        }
        Ok(())
    }
}

fn snapshot_tag(agent_id: &str, name: &str) -> String {
    format!("claude-agent-{agent_id}-snapshot:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::mock::MockRuntime;

    fn environments() -> HashMap<String, EnvironmentSpec> {
        let mut m = HashMap::new();
        m.insert(
            "default".to_string(),
            EnvironmentSpec {
                image: "claude-worker:latest".to_string(),
                packages: vec![],
                volumes: HashMap::new(),
                memory: "2g".to_string(),
                cpu: "1.0".to_string(),
            },
        );
        m
    }

    fn controller(runtime: std::sync::Arc<MockRuntime>, root: &std::path::Path) -> WorkspaceController {
        WorkspaceController::new(runtime, environments(), root.to_path_buf(), 3)
    }

    #[tokio::test]
    async fn create_workspace_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        let controller = controller(runtime.clone(), dir.path());
        let first = controller.create_workspace("agent_000", "default").await.unwrap();
        let second = controller.create_workspace("agent_000", "default").await.unwrap();
        assert_ne!(first.container_id, second.container_id);
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn unknown_environment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        let controller = controller(runtime, dir.path());
        let result = controller.create_workspace("agent_000", "nonexistent").await;
        assert!(matches!(result, Err(WorkspaceError::UnknownEnvironment(_))));
    }

    #[tokio::test]
    async fn failed_create_leaves_no_partial_container() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        runtime.fail_next_create();
        let controller = controller(runtime.clone(), dir.path());
        let result = controller.create_workspace("agent_000", "default").await;
        assert!(result.is_err());
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        let controller = controller(runtime, dir.path());
        controller.create_workspace("agent_000", "default").await.unwrap();
        let name = controller.create_snapshot("agent_000", Some("before-refactor".into())).await.unwrap();
        let restored = controller.restore_snapshot("agent_000", &name).await.unwrap();
        assert_eq!(restored.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn restore_unknown_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        let controller = controller(runtime, dir.path());
        controller.create_workspace("agent_000", "default").await.unwrap();
        let result = controller.restore_snapshot("agent_000", "nonexistent").await;
        assert!(matches!(result, Err(WorkspaceError::SnapshotNotFound { .. })));
    }

    #[tokio::test]
    async fn repeated_create_failures_open_the_circuit_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        runtime.fail_create_always();
        let controller = controller(runtime.clone(), dir.path());

        for _ in 0..3 {
            let result = controller.create_workspace("agent_000", "default").await;
            assert!(matches!(result, Err(WorkspaceError::Container { .. })));
        }

        // The breaker is now open: a further call is rejected before it ever
        // reaches the runtime, even for an agent that never failed before.
        let result = controller.create_workspace("agent_001", "default").await;
        assert!(matches!(result, Err(WorkspaceError::CircuitOpen { operation: "provision" })));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = std::sync::Arc::new(MockRuntime::new());
        let controller = controller(runtime, dir.path());
        controller.create_workspace("agent_000", "default").await.unwrap();
        controller.cleanup("agent_000", false).await.unwrap();
        controller.cleanup("agent_000", false).await.unwrap();
    }
}
