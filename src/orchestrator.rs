//! Task Queue consumer: the Dispatcher/Orchestrator that selects an agent
//! per task, enforces timeouts, records results, and tracks statistics.
//!
//! The agent set is a `Mutex<Vec<Arc<AgentRuntime>>>`. Per the resource
//! model, `execute_task`'s selection step holds that mutex only long enough
//! to pick an idle agent and flip it to `busy`; the actual dispatch and
//! wait for completion happen after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::agent::{AgentConfig, AgentRuntime, AgentState};
use crate::channel::Channel;
use crate::error::OrchestratorError;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskResult, TaskStatus, TaskType, NO_AGENT};
use crate::workspace::WorkspaceController;

const SELECTION_POLL_INTERVAL: Duration = Duration::from_millis(20);
const DISPATCH_LOOP_IDLE_POLL: Duration = Duration::from_millis(50);
const BROKER_RELAY_POLL: Duration = Duration::from_millis(20);

/// Running totals exposed read-only, per the data model's statistics
/// requirement: counts plus the sum needed to derive an average.
#[derive(Debug, Default)]
pub struct Statistics {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    execution_time_total_millis: AtomicU64,
}

impl Statistics {
    fn record(&self, status: TaskStatus, execution_time: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if matches!(status, TaskStatus::Failed | TaskStatus::Timeout) {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.execution_time_total_millis.fetch_add(execution_time.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total tasks whose result has been recorded (any status).
    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    /// Tasks recorded with a `failed` or `timeout` status.
    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::Relaxed)
    }

    /// Mean execution time in seconds across every recorded task, or 0.0
    /// before the first one completes.
    pub fn average_execution_time(&self) -> f64 {
        let completed = self.tasks_completed();
        if completed == 0 {
            return 0.0;
        }
        let total_millis = self.execution_time_total_millis.load(Ordering::Relaxed);
        (total_millis as f64 / 1000.0) / completed as f64
    }
}

/// Append-mostly index of the most recent [`TaskResult`] per `task_id`.
/// Backed by [`DashMap`] so reads never block a concurrent writer, per the
/// resource model's "lock-free reads" guidance.
#[derive(Debug, Default)]
pub struct ResultStore {
    results: DashMap<String, TaskResult>,
}

impl ResultStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the result for `result.task_id`.
    pub fn insert(&self, result: TaskResult) {
        self.results.insert(result.task_id.clone(), result);
    }

    /// Look up the most recent result for `task_id`.
    pub fn get(&self, task_id: &str) -> Option<TaskResult> {
        self.results.get(task_id).map(|entry| entry.clone())
    }

    /// Number of resident results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the store holds no results.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Drop every resident result older than `max_age`, relative to each
    /// result's own `timestamp`. Used as the eviction policy named in the
    /// data model's result-store ownership section.
    pub fn evict_older_than(&self, max_age: chrono::Duration) {
        let cutoff = chrono::Utc::now() - max_age;
        self.results.retain(|_, result| result.timestamp >= cutoff);
    }
}

/// Errors specific to orchestrator startup and shutdown. Task-level
/// failures never appear here; they are captured as [`TaskResult`]s.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Fewer than `min_agents` started successfully.
    #[error("only {started} of {requested} agents started (minimum {min_agents})")]
    InsufficientAgents {
        /// Agents that started successfully.
        started: usize,
        /// Agents requested.
        requested: usize,
        /// Configured minimum.
        min_agents: usize,
    },
    /// The broker socket could not be opened.
    #[error(transparent)]
    Channel(#[from] crate::channel::ChannelError),
}

/// End-to-end task lifecycle owner: opens the broker, starts the agent
/// fleet, and runs the background dispatch loop that drains the
/// [`TaskQueue`] and hands tasks to idle agents.
pub struct Orchestrator {
    broker: Arc<Channel>,
    agents: Mutex<Vec<Arc<AgentRuntime>>>,
    queue: Arc<TaskQueue>,
    results: Arc<ResultStore>,
    stats: Arc<Statistics>,
    pending: Mutex<HashMap<String, oneshot::Sender<TaskResult>>>,
    worker_pool: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
    broker_loop: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
    broker_socket: std::path::PathBuf,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Open the broker socket at `broker_socket` and prepare an empty agent
    /// fleet. Call [`start`](Self::start) to actually bring agents up.
    pub async fn new(
        broker_socket: std::path::PathBuf,
        connect_timeout: Duration,
        max_workers: usize,
        queue_max_size: usize,
    ) -> Result<Self, DispatchError> {
        let broker = Arc::new(Channel::open_server(&broker_socket).await?);
        Ok(Self {
            broker,
            agents: Mutex::new(Vec::new()),
            queue: Arc::new(TaskQueue::new(queue_max_size)),
            results: Arc::new(ResultStore::new()),
            stats: Arc::new(Statistics::default()),
            pending: Mutex::new(HashMap::new()),
            worker_pool: Arc::new(Semaphore::new(max_workers.max(1))),
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatch_loop: Mutex::new(None),
            broker_loop: Mutex::new(None),
            connect_timeout,
            broker_socket,
        })
    }

    /// The broker socket path this orchestrator's agents connect back to.
    pub fn broker_socket(&self) -> &std::path::Path {
        &self.broker_socket
    }

    /// Read-only access to accumulated statistics.
    pub fn statistics(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    /// Read-only access to the result store, for late retrieval of a
    /// previously-dispatched task's outcome.
    pub fn results(&self) -> Arc<ResultStore> {
        self.results.clone()
    }

    /// Start `configs.len()` agents in parallel against `workspace`.
    /// Succeeds if at least `min_agents` come up; the rest are logged and
    /// dropped. Starts the background dispatch loop on success.
    #[instrument(skip(self, workspace, configs))]
    pub async fn start(
        self: &Arc<Self>,
        workspace: Arc<WorkspaceController>,
        configs: Vec<AgentConfig>,
        min_agents: usize,
        health_check_interval: Duration,
        health_failure_threshold: u32,
    ) -> Result<(), DispatchError> {
        let requested = configs.len();
        let attempts = configs.into_iter().map(|config| {
            let workspace = workspace.clone();
            let broker_socket = self.broker_socket.clone();
            let connect_timeout = self.connect_timeout;
            async move {
                let agent = Arc::new(AgentRuntime::new(config, workspace, health_check_interval, health_failure_threshold));
                match agent.start(&broker_socket, connect_timeout).await {
                    Ok(()) => Some(agent),
                    Err(err) => {
                        warn!(agent_id = %agent.agent_id(), %err, "orchestrator: agent failed to start");
                        None
                    }
                }
            }
        });

        let started: Vec<Arc<AgentRuntime>> = join_all(attempts).await.into_iter().flatten().collect();
        if started.len() < min_agents {
            return Err(DispatchError::InsufficientAgents { started: started.len(), requested, min_agents });
        }

        info!(started = started.len(), requested, "orchestrator: agent fleet up");
        *self.agents.lock().await = started;

        self.spawn_dispatch_loop().await;
        self.spawn_broker_loop().await;
        Ok(())
    }

    /// Drain messages the broker receives from connected agents and route
    /// each one by its `receiver_id`: broadcast fans out to every other
    /// connected peer, anything else goes to whichever peer announced that
    /// agent id. This is what lets one agent's `request_peer_task` reach
    /// another agent's registered handler without either connecting
    /// directly to the other.
    async fn spawn_broker_loop(self: &Arc<Self>) {
        let broker = self.broker.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let Some(message) = broker.receive(BROKER_RELAY_POLL).await else { continue };
                let result = if message.is_broadcast() {
                    broker.broadcast(&message, Some(message.sender_id.as_str())).await
                } else {
                    broker.send(&message).await
                };
                if let Err(err) = result {
                    warn!(%err, receiver = %message.receiver_id, "broker: failed to route message");
                }
            }
        });
        self.broker_loop.lock().await.replace(handle);
    }

    async fn spawn_dispatch_loop(self: &Arc<Self>) {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let task = this.queue.dequeue(Some(DISPATCH_LOOP_IDLE_POLL)).await;
                let Some(task) = task else { continue };
                this.dispatch_one(task).await;
            }
        });
        self.dispatch_loop.lock().await.replace(handle);
    }

    async fn dispatch_one(self: &Arc<Self>, task: Task) {
        let task_id = task.task_id.clone();

        if task.timeout.is_zero() {
            self.deliver(TaskResult {
                task_id,
                agent_id: NO_AGENT.to_string(),
                status: TaskStatus::Timeout,
                result: serde_json::Map::new(),
                error: Some("task timeout is zero".to_string()),
                execution_time: 0.0,
                timestamp: chrono::Utc::now(),
            })
            .await;
            return;
        }

        match self.acquire_agent(task.timeout).await {
            Some(agent) => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_on_agent(agent, task).await;
                });
            }
            None => {
                self.deliver(TaskResult::rejected(task_id, "no_available_agents")).await;
            }
        }
    }

    /// Select the idle agent with the fewest completed tasks (ties broken
    /// by `agent_id`), waiting up to `deadline` for one to free up. Marks
    /// the chosen agent `busy` before releasing the agent-map lock, so the
    /// orchestrator never hands the same agent to two tasks at once.
    async fn acquire_agent(&self, deadline: Duration) -> Option<Arc<AgentRuntime>> {
        let started = Instant::now();
        loop {
            {
                let agents = self.agents.lock().await;
                let mut best: Option<&Arc<AgentRuntime>> = None;
                for agent in agents.iter() {
                    if agent.state().await != AgentState::Idle {
                        continue;
                    }
                    best = match best {
                        None => Some(agent),
                        Some(current) => {
                            if agent.tasks_completed() < current.tasks_completed()
                                || (agent.tasks_completed() == current.tasks_completed() && agent.agent_id() < current.agent_id())
                            {
                                Some(agent)
                            } else {
                                Some(current)
                            }
                        }
                    };
                }
                if let Some(agent) = best {
                    agent.set_state(AgentState::Busy).await;
                    return Some(agent.clone());
                }
            }
            if started.elapsed() >= deadline {
                return None;
            }
            tokio::time::sleep(SELECTION_POLL_INTERVAL.min(deadline)).await;
        }
    }

    async fn run_on_agent(self: Arc<Self>, agent: Arc<AgentRuntime>, task: Task) {
        let _permit = self.worker_pool.acquire().await.expect("worker pool semaphore is never closed");
        let started = Instant::now();
        let outcome = tokio::time::timeout(task.timeout, agent.execute_task(&task)).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(result) => result,
            Err(_) => TaskResult {
                task_id: task.task_id.clone(),
                agent_id: agent.agent_id().to_string(),
                status: TaskStatus::Timeout,
                result: serde_json::Map::new(),
                error: Some(format!("task exceeded its {:?} timeout", task.timeout)),
                execution_time: elapsed.as_secs_f64(),
                timestamp: chrono::Utc::now(),
            },
        };

        agent.finish_task().await;
        self.stats.record(result.status, elapsed);
        self.deliver(result).await;
    }

    async fn deliver(&self, result: TaskResult) {
        self.results.insert(result.clone());
        if let Some(sender) = self.pending.lock().await.remove(&result.task_id) {
            let _ = sender.send(result);
        }
    }

    /// Validate, enqueue, dispatch, and await the single [`TaskResult`] for
    /// `task`. Never raises for an operational failure: only an invalid
    /// task descriptor surfaces as [`OrchestratorError::TaskValidation`].
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    pub async fn execute_task(&self, task: Task) -> Result<TaskResult, OrchestratorError> {
        task.validate()?;
        let task_id = task.task_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(task_id.clone(), tx);

        if let Err(err) = self.queue.enqueue(task).await {
            self.pending.lock().await.remove(&task_id);
            warn!(%task_id, %err, "orchestrator: queue full, rejecting task");
            return Ok(TaskResult::rejected(task_id, "queue_full"));
        }

        match rx.await {
            Ok(result) => Ok(result),
            Err(_) => Ok(TaskResult::rejected(task_id, "orchestrator shut down before dispatch")),
        }
    }

    /// Fan `task.subtasks` out across distinct agents concurrently,
    /// returning one [`TaskResult`] per subtask. A task with `parallel =
    /// false` or no subtasks degenerates to a single-element result of
    /// running `task` itself. The parent's own `task_id` is also recorded
    /// in the result store with an aggregate status (`partial` when
    /// subtasks disagree) so it can be retrieved like any other task.
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    pub async fn execute_parallel_task(&self, task: Task) -> Result<Vec<TaskResult>, OrchestratorError> {
        if !task.parallel || task.subtasks.is_empty() {
            return Ok(vec![self.execute_task(task).await?]);
        }
        let parent_id = task.task_id.clone();
        let subtasks = task.resolved_subtasks();
        let futures = subtasks.into_iter().map(|sub| self.execute_task(sub));
        let results: Vec<TaskResult> = join_all(futures).await.into_iter().collect::<Result<_, _>>()?;

        self.results.insert(aggregate_result(&parent_id, &results));
        Ok(results)
    }

    /// Number of agents currently tracked (any lifecycle state).
    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }

    /// Number of agents currently `idle`.
    pub async fn idle_agent_count(&self) -> usize {
        let agents = self.agents.lock().await;
        let mut count = 0;
        for agent in agents.iter() {
            if agent.state().await == AgentState::Idle {
                count += 1;
            }
        }
        count
    }

    /// Replace a failed agent's slot in the fleet, e.g. after the
    /// Supervisor decides to restart it. The old entry (matched by
    /// `agent_id`) is dropped without `stop()` being called on it; callers
    /// are expected to have already torn it down.
    pub async fn replace_agent(&self, agent_id: &str, replacement: Arc<AgentRuntime>) {
        let mut agents = self.agents.lock().await;
        agents.retain(|a| a.agent_id() != agent_id);
        agents.push(replacement);
    }

    /// Snapshot of every tracked agent, for health monitoring and
    /// diagnostics.
    pub async fn agents_snapshot(&self) -> Vec<Arc<AgentRuntime>> {
        self.agents.lock().await.clone()
    }

    /// Cooperative shutdown: stop the dispatch loop, stop every agent, and
    /// close the broker. Safe to call once; a second call is a no-op
    /// beyond closing an already-closed channel.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace_period: Duration) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.dispatch_loop.lock().await.take() {
            let _ = tokio::time::timeout(grace_period, handle).await;
        }
        if let Some(handle) = self.broker_loop.lock().await.take() {
            let _ = tokio::time::timeout(grace_period, handle).await;
        }

        let agents = self.agents.lock().await.clone();
        let stops = agents.iter().map(|agent| agent.stop());
        for result in join_all(stops).await {
            if let Err(err) = result {
                warn!(%err, "orchestrator: agent failed to stop cleanly");
            }
        }
    }
}

/// Default task type used by CLI/test helpers that don't care which
/// grammar a smoke-test task exercises.
pub const DEFAULT_SMOKE_TASK_TYPE: TaskType = TaskType::Generic;

/// Roll a parallel task's per-subtask results into one summary result
/// stored under the parent's `task_id`: `success` if every subtask
/// succeeded, `failed` if none did, `partial` otherwise.
fn aggregate_result(parent_id: &str, results: &[TaskResult]) -> TaskResult {
    let succeeded = results.iter().filter(|r| r.status == TaskStatus::Success).count();
    let status = if succeeded == results.len() {
        TaskStatus::Success
    } else if succeeded == 0 {
        TaskStatus::Failed
    } else {
        TaskStatus::Partial
    };
    let execution_time = results.iter().map(|r| r.execution_time).fold(0.0, f64::max);
    let mut result = serde_json::Map::new();
    result.insert(
        "subtasks".to_string(),
        serde_json::Value::Array(results.iter().map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null)).collect()),
    );
    TaskResult {
        task_id: parent_id.to_string(),
        agent_id: NO_AGENT.to_string(),
        status,
        result,
        error: None,
        execution_time,
        timestamp: chrono::Utc::now(),
    }
}
