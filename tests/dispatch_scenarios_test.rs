//! End-to-end dispatch scenarios driven entirely through the public
//! `Orchestrator` API, against the in-memory `MockRuntime` container
//! backend (`test-utils` feature) so no Docker daemon is required.

#![cfg(feature = "test-utils")]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use claude_orchestrator::agent::AgentConfig;
use claude_orchestrator::orchestrator::Orchestrator;
use claude_orchestrator::task::{Task, TaskStatus, TaskType};
use claude_orchestrator::workspace::mock::MockRuntime;
use claude_orchestrator::workspace::{EnvironmentSpec, WorkspaceController};

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

async fn start_orchestrator(dir: &Path, n_agents: usize, runtime: Arc<MockRuntime>) -> Arc<Orchestrator> {
    let socket = dir.join("broker.sock");
    let orchestrator = Arc::new(Orchestrator::new(socket, Duration::from_secs(2), 10, 100).await.unwrap());
    let workspace = Arc::new(WorkspaceController::new(runtime, environments(), dir.to_path_buf(), 3));
    let configs: Vec<AgentConfig> = (0..n_agents)
        .map(|i| AgentConfig::new(format!("agent_{i:03}"), "default", dir, vec!["claude".into(), "--headless".into()]))
        .collect();
    orchestrator.start(workspace, configs, 1, Duration::from_secs(30), 3).await.unwrap();
    orchestrator
}

fn task(id: &str, priority: u8, description: &str, timeout: Duration) -> Task {
    Task {
        task_id: id.into(),
        task_type: TaskType::Generic,
        description: description.into(),
        files: vec![],
        parallel: false,
        subtasks: vec![],
        priority,
        timeout,
    }
}

/// Scenario 1: a single generic task against one agent comes back
/// successful, carrying the worker's literal echoed output.
#[tokio::test]
async fn single_generic_task_against_one_agent_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    runtime.respond_to("echo", "hello");
    let orchestrator = start_orchestrator(dir.path(), 1, runtime).await;

    let result = orchestrator
        .execute_task(task("t1", 5, "echo hello", Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.result.get("output").and_then(|v| v.as_str()), Some("hello"));
    orchestrator.shutdown(Duration::from_secs(2)).await;
}

/// Scenario 2: with the sole agent occupied, three tasks of differing
/// priority queue up. Once the occupying task clears, dispatch order must
/// run highest priority first, `9, 5, 1`.
#[tokio::test]
async fn priority_ordering_dispatches_highest_priority_first_once_agent_frees_up() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    runtime.respond_to("echo", "ok");
    let orchestrator = start_orchestrator(dir.path(), 1, runtime).await;

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    // Z occupies the sole agent: `sleep` commands never produce a worker
    // reply, so Z rides out its own short timeout before the agent frees up.
    let z_order = order.clone();
    let z_orchestrator = orchestrator.clone();
    let z = tokio::spawn(async move {
        let result = z_orchestrator
            .execute_task(task("Z", 5, "sleep 60", Duration::from_millis(150)))
            .await
            .unwrap();
        z_order.lock().unwrap().push(result.task_id);
    });

    // Give the dispatch loop a moment to claim the agent for Z before A/B/C
    // are even submitted, matching "pre-submitted long task" in the scenario.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut handles = Vec::new();
    for (id, priority) in [("A", 1u8), ("B", 9u8), ("C", 5u8)] {
        let order = order.clone();
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let result = orchestrator
                .execute_task(task(id, priority, "echo hi", Duration::from_secs(5)))
                .await
                .unwrap();
            order.lock().unwrap().push(result.task_id);
        }));
    }

    z.await.unwrap();
    for h in handles {
        h.await.unwrap();
    }

    let finished = order.lock().unwrap().clone();
    assert_eq!(finished, vec!["Z", "B", "C", "A"]);
    orchestrator.shutdown(Duration::from_secs(2)).await;
}

/// Scenario 4: a task whose worker never answers within its timeout comes
/// back `status = timeout`, and the agent returns to `idle` shortly after.
#[tokio::test]
async fn unresponsive_worker_produces_a_timeout_result_and_agent_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = start_orchestrator(dir.path(), 1, runtime).await;

    let started = std::time::Instant::now();
    let result = orchestrator
        .execute_task(task("t1", 5, "sleep 60", Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(started.elapsed() <= Duration::from_secs(3));

    // The agent must be usable again shortly after.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.idle_agent_count().await, 1);

    orchestrator.shutdown(Duration::from_secs(2)).await;
}

/// A task submitted with `timeout = 0` resolves immediately as a timeout,
/// without ever touching an agent.
#[tokio::test]
async fn zero_timeout_resolves_immediately_without_assigning_an_agent() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = start_orchestrator(dir.path(), 1, runtime).await;

    let result = orchestrator
        .execute_task(task("t1", 5, "echo hi", Duration::from_secs(0)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert_eq!(result.agent_id, "none");

    orchestrator.shutdown(Duration::from_secs(2)).await;
}
