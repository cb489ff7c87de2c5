//! In-memory [`ContainerRuntime`] fake, so workspace/agent/dispatcher tests
//! run without a live Docker daemon.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{AttachedProcess, ContainerRuntime, ContainerSpec, ExecOutput, WorkspaceError};

struct MockContainer {
    running: bool,
}

/// In-memory stand-in for the Docker Engine API. `exec`/`spawn_attached`
/// echo a canned response derived from the command so agent-runtime tests
/// can assert on what was issued without a real worker binary.
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    next_id: AtomicU64,
    fail_next_create: AtomicBool,
    fail_create_always: AtomicBool,
    responders: Arc<Mutex<HashMap<String, String>>>,
}

impl MockRuntime {
    /// Construct an empty fake with no containers.
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            fail_next_create: AtomicBool::new(false),
            fail_create_always: AtomicBool::new(false),
            responders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make the next `create_container` call fail, to exercise the
    /// no-partial-container-on-failure invariant.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent `create_container` call fail, to exercise
    /// repeated-failure behavior such as circuit breaking.
    pub fn fail_create_always(&self) {
        self.fail_create_always.store(true, Ordering::SeqCst);
    }

    /// Number of containers currently tracked (created and not removed).
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Register a canned stdout response for a given first word of a
    /// command (e.g. `"review"` -> a JSON blob).
    pub fn respond_to(&self, command_verb: &str, response: &str) {
        self.responders.lock().unwrap().insert(command_verb.to_string(), response.to_string());
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, WorkspaceError> {
        if self.fail_create_always.load(Ordering::SeqCst) || self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(WorkspaceError::Container {
                operation: "create",
                message: "simulated failure".into(),
                exit_code: None,
            });
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(id.clone(), MockContainer { running: false });
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), WorkspaceError> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(container_id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(WorkspaceError::Container { operation: "start", message: "no such container".into(), exit_code: None }),
        }
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, WorkspaceError> {
        Ok(self.containers.lock().unwrap().get(container_id).is_some_and(|c| c.running))
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), WorkspaceError> {
        if let Some(c) = self.containers.lock().unwrap().get_mut(container_id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), WorkspaceError> {
        self.containers.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        _deadline: Duration,
    ) -> Result<ExecOutput, WorkspaceError> {
        if !self.containers.lock().unwrap().contains_key(container_id) {
            return Err(WorkspaceError::Container { operation: "exec", message: "no such container".into(), exit_code: None });
        }
        let verb = command.first().cloned().unwrap_or_default();
        let stdout = self
            .responders
            .lock()
            .unwrap()
            .get(&verb)
            .cloned()
            .unwrap_or_else(|| format!("ok: {}", command.join(" ")));
        Ok(ExecOutput { exit_code: 0, stdout, stderr: String::new() })
    }

    async fn spawn_attached(
        &self,
        container_id: &str,
        _command: &[String],
    ) -> Result<Box<dyn AttachedProcess>, WorkspaceError> {
        if !self.containers.lock().unwrap().contains_key(container_id) {
            return Err(WorkspaceError::Container { operation: "spawn", message: "no such container".into(), exit_code: None });
        }
        Ok(Box::new(MockAttachedProcess::new(self.responders.clone())))
    }

    async fn commit(&self, container_id: &str, _image_tag: &str) -> Result<(), WorkspaceError> {
        if !self.containers.lock().unwrap().contains_key(container_id) {
            return Err(WorkspaceError::Container { operation: "commit", message: "no such container".into(), exit_code: None });
        }
        Ok(())
    }

    async fn remove_volume(&self, _name: &str) -> Result<(), WorkspaceError> {
        Ok(())
    }
}

/// Canned attached process: a registered [`MockRuntime::respond_to`] reply
/// for the line's first word wins; otherwise every written line is echoed
/// back on stdout prefixed `ok: `, except `echo health_check` which answers
/// `healthy`, `\x03` (terminate) which closes the stream, and a line
/// starting with `sleep` which never replies (simulates a worker wedged on a
/// long-running command, for exercising task-timeout behavior without a
/// real delay).
struct MockAttachedProcess {
    stdout_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    stdout_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    responders: Arc<Mutex<HashMap<String, String>>>,
}

impl MockAttachedProcess {
    fn new(responders: Arc<Mutex<HashMap<String, String>>>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        Self { stdout_tx: Mutex::new(Some(stdout_tx)), stdout_rx: tokio::sync::Mutex::new(stdout_rx), responders }
    }

    /// Drop the sender half so the parked `read_stdout_line` reader wakes
    /// with `None` instead of blocking forever on a receiver lock the reader
    /// itself holds across its `recv().await`.
    fn close_stdout(&self) {
        self.stdout_tx.lock().unwrap().take();
    }
}

#[async_trait]
impl AttachedProcess for MockAttachedProcess {
    async fn write_line(&self, line: &str) -> Result<(), WorkspaceError> {
        if line == "\x03" || line.trim_start().starts_with("sleep") {
            return Ok(());
        }
        let verb = line.split_whitespace().next().unwrap_or_default();
        let reply = if line.trim() == "echo health_check" {
            "healthy".to_string()
        } else if let Some(canned) = self.responders.lock().unwrap().get(verb) {
            canned.clone()
        } else {
            format!("ok: {line}")
        };
        if let Some(tx) = self.stdout_tx.lock().unwrap().as_ref() {
            let _ = tx.send(reply);
        }
        Ok(())
    }

    async fn read_stdout_line(&self) -> Result<Option<String>, WorkspaceError> {
        Ok(self.stdout_rx.lock().await.recv().await)
    }

    async fn read_stderr_line(&self) -> Result<Option<String>, WorkspaceError> {
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn terminate(&self) -> Result<(), WorkspaceError> {
        self.close_stdout();
        Ok(())
    }

    async fn kill(&self) -> Result<(), WorkspaceError> {
        self.close_stdout();
        Ok(())
    }
}
