//! [`ContainerRuntime`] backed by the Docker Engine API over its local
//! Unix-domain socket, via `bollard`.

use std::time::Duration;

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CommitContainerOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder, RemoveVolumeOptions, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{AttachedProcess, ContainerRuntime, ContainerSpec, ExecOutput, WorkspaceError};

/// Security posture applied to every container this runtime creates:
/// all capabilities dropped, no privilege escalation, host UID preserved.
fn hardened_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut binds = vec![format!("{}:{}", spec.host_workspace.display(), spec.guest_workspace)];
    for (name, guest_path) in &spec.volumes {
        binds.push(format!("{name}:{guest_path}"));
    }
    HostConfig {
        binds: Some(binds),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        memory: parse_memory(&spec.memory),
        nano_cpus: parse_cpu(&spec.cpu),
        pids_limit: Some(1024),
        userns_mode: Some("host".to_string()),
        ..Default::default()
    }
}

fn parse_memory(shorthand: &str) -> Option<i64> {
    let lower = shorthand.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(prefix) = lower.strip_suffix('g') {
        (prefix, 1024 * 1024 * 1024)
    } else if let Some(prefix) = lower.strip_suffix('m') {
        (prefix, 1024 * 1024)
    } else if let Some(prefix) = lower.strip_suffix('k') {
        (prefix, 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits.trim().parse::<i64>().ok().map(|n| n * multiplier)
}

fn parse_cpu(cores: &str) -> Option<i64> {
    cores.trim().parse::<f64>().ok().map(|c| (c * 1_000_000_000.0) as i64)
}

/// Live Docker-backed [`ContainerRuntime`].
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using its default Unix socket.
    pub fn connect() -> Result<Self, WorkspaceError> {
        let docker = Docker::connect_with_local_defaults().map_err(|err| WorkspaceError::Container {
            operation: "connect",
            message: err.to_string(),
            exit_code: None,
        })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, WorkspaceError> {
        let options = CreateContainerOptionsBuilder::default().name(&spec.name).build();
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            host_config: Some(hardened_host_config(spec)),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map(|response| response.id)
            .map_err(|err| WorkspaceError::Container { operation: "create", message: err.to_string(), exit_code: None })
    }

    async fn start_container(&self, container_id: &str) -> Result<(), WorkspaceError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(|err| WorkspaceError::Container { operation: "start", message: err.to_string(), exit_code: None })
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, WorkspaceError> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| WorkspaceError::Container { operation: "inspect", message: err.to_string(), exit_code: None })?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), WorkspaceError> {
        let options = StopContainerOptionsBuilder::default().t(10).build();
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(|err| WorkspaceError::Container { operation: "stop", message: err.to_string(), exit_code: None })
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), WorkspaceError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|err| WorkspaceError::Container { operation: "remove", message: err.to_string(), exit_code: None })
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        deadline: Duration,
    ) -> Result<ExecOutput, WorkspaceError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| WorkspaceError::Container { operation: "exec_create", message: err.to_string(), exit_code: None })?;

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } =
                self.docker.start_exec(&exec.id, None::<StartExecOptions>).await.map_err(|err| {
                    WorkspaceError::Container { operation: "exec_start", message: err.to_string(), exit_code: None }
                })?
            {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            return Err(WorkspaceError::Container {
                                operation: "exec_stream",
                                message: err.to_string(),
                                exit_code: None,
                            })
                        }
                    }
                }
            }
            Ok((stdout, stderr))
        };

        let (stdout, stderr) = tokio::time::timeout(deadline, run).await.map_err(|_| WorkspaceError::Container {
            operation: "exec",
            message: format!("exec of {:?} exceeded deadline {:?}", command, deadline),
            exit_code: None,
        })??;

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(|err| WorkspaceError::Container {
            operation: "exec_inspect",
            message: err.to_string(),
            exit_code: None,
        })?;

        Ok(ExecOutput { exit_code: inspect.exit_code.unwrap_or(-1), stdout, stderr })
    }

    async fn spawn_attached(
        &self,
        container_id: &str,
        command: &[String],
    ) -> Result<Box<dyn AttachedProcess>, WorkspaceError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| WorkspaceError::Container { operation: "exec_create", message: err.to_string(), exit_code: None })?;

        let started = self.docker.start_exec(&exec.id, None::<StartExecOptions>).await.map_err(|err| {
            WorkspaceError::Container { operation: "exec_start", message: err.to_string(), exit_code: None }
        })?;

        let StartExecResults::Attached { input, mut output } = started else {
            return Err(WorkspaceError::Container {
                operation: "exec_start",
                message: "exec was not attachable (detached mode)".into(),
                exit_code: None,
            });
        };

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        for line in String::from_utf8_lossy(&message).lines() {
                            let _ = stdout_tx.send(line.to_string());
                        }
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        for line in String::from_utf8_lossy(&message).lines() {
                            let _ = stderr_tx.send(line.to_string());
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(Box::new(DockerAttachedProcess {
            input: tokio::sync::Mutex::new(input),
            stdout_rx: tokio::sync::Mutex::new(stdout_rx),
            stderr_rx: tokio::sync::Mutex::new(stderr_rx),
        }))
    }

    async fn commit(&self, container_id: &str, image_tag: &str) -> Result<(), WorkspaceError> {
        let (repo, tag) = image_tag.split_once(':').unwrap_or((image_tag, "latest"));
        let options = CommitContainerOptionsBuilder::default().container(container_id).repo(repo).tag(tag).build();
        self.docker
            .commit_container(options, ContainerCreateBody::default())
            .await
            .map(|_| ())
            .map_err(|err| WorkspaceError::Container { operation: "commit", message: err.to_string(), exit_code: None })
    }

    async fn remove_volume(&self, name: &str) -> Result<(), WorkspaceError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|err| WorkspaceError::Container { operation: "remove_volume", message: err.to_string(), exit_code: None })
    }
}

struct DockerAttachedProcess {
    input: tokio::sync::Mutex<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>,
    stdout_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    stderr_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl AttachedProcess for DockerAttachedProcess {
    async fn write_line(&self, line: &str) -> Result<(), WorkspaceError> {
        use tokio::io::AsyncWriteExt;
        self.input
            .lock()
            .await
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|err| WorkspaceError::Container { operation: "write_stdin", message: err.to_string(), exit_code: None })
    }

    async fn read_stdout_line(&self) -> Result<Option<String>, WorkspaceError> {
        Ok(self.stdout_rx.lock().await.recv().await)
    }

    async fn read_stderr_line(&self) -> Result<Option<String>, WorkspaceError> {
        Ok(self.stderr_rx.lock().await.recv().await)
    }

    async fn terminate(&self) -> Result<(), WorkspaceError> {
        self.write_line("\x03").await
    }

    async fn kill(&self) -> Result<(), WorkspaceError> {
        self.stdout_rx.lock().await.close();
        self.stderr_rx.lock().await.close();
        Ok(())
    }
}
