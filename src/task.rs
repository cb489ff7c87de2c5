//! The `Task`/`TaskResult` data model and submission-time validation.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default task timeout when the submitter does not set one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Enumerated task kind. Extensible: an unrecognized string round-trips as
/// [`TaskType::Custom`] instead of failing to deserialize, so new worker
/// command grammars can be introduced without breaking older submitters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Review the staged files and report issues.
    CodeReview,
    /// Refactor the staged files per the task description.
    Refactor,
    /// Generate tests for the staged files.
    TestGeneration,
    /// Free-form analysis of the task description.
    Analysis,
    /// Send the description to the worker verbatim.
    Generic,
    /// A task type not recognized by this build of the kernel.
    Custom(String),
}

impl TaskType {
    fn as_str(&self) -> &str {
        match self {
            TaskType::CodeReview => "code_review",
            TaskType::Refactor => "refactor",
            TaskType::TestGeneration => "test_generation",
            TaskType::Analysis => "analysis",
            TaskType::Generic => "generic",
            TaskType::Custom(s) => s,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        match s {
            "code_review" => TaskType::CodeReview,
            "refactor" => TaskType::Refactor,
            "test_generation" => TaskType::TestGeneration,
            "analysis" => TaskType::Analysis,
            "generic" => TaskType::Generic,
            other => TaskType::Custom(other.to_string()),
        }
    }
}

impl Serialize for TaskType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(TaskType::from(s.as_str()))
    }
}

/// A partial task descriptor nested under a parallel parent's `subtasks`.
/// Unset fields inherit the parent's value; `timeout`, when unset, inherits
/// the parent's timeout exactly (never exceeding it), while an explicit
/// override may be any non-negative duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Subtask identifier, unique alongside its siblings and the parent.
    pub task_id: String,
    /// Overrides the parent's `task_type` when set.
    #[serde(default)]
    pub task_type: Option<TaskType>,
    /// Overrides the parent's `description` when set.
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the parent's `files` when set.
    #[serde(default)]
    pub files: Option<Vec<PathBuf>>,
    /// Overrides the parent's `priority` when set.
    #[serde(default)]
    pub priority: Option<u8>,
    /// Overrides the parent's `timeout` when set.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque identifier assigned by the submitter, unique while resident.
    pub task_id: String,
    /// What kind of worker command this task translates into.
    pub task_type: TaskType,
    /// Free-text payload passed to the worker.
    pub description: String,
    /// Files to stage into the workspace before execution.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// If true, `subtasks` is fanned out to multiple agents concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Partial descriptors inheriting this task's defaults. Required
    /// non-empty when `parallel` is true.
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
    /// 1-10; higher value dispatches earlier.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Wall-clock budget for this task, start to finish.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_priority() -> u8 {
    5
}

fn default_timeout() -> Duration {
    DEFAULT_TASK_TIMEOUT
}

mod duration_secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }

    use serde::Deserialize;
}

/// Raised by [`Task::validate`] for a descriptor that cannot be dispatched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskValidationError {
    /// `priority` outside the 1-10 range.
    #[error("priority {0} out of range 1-10")]
    PriorityOutOfRange(u8),
    /// `parallel` set but `subtasks` is empty.
    #[error("parallel task {task_id} has no subtasks")]
    EmptySubtasks {
        /// The offending task's id.
        task_id: String,
    },
    /// Two subtasks (or a subtask and the parent) share a `task_id`.
    #[error("duplicate task_id {0} among subtasks")]
    DuplicateSubtaskId(String),
    /// `task_id` is the empty string.
    #[error("task_id must not be empty")]
    EmptyTaskId,
}

impl Task {
    /// Check the invariants from the data model: priority range, non-empty
    /// subtasks for a parallel task, and unique ids among task + subtasks.
    pub fn validate(&self) -> Result<(), TaskValidationError> {
        if self.task_id.is_empty() {
            return Err(TaskValidationError::EmptyTaskId);
        }
        if !(1..=10).contains(&self.priority) {
            return Err(TaskValidationError::PriorityOutOfRange(self.priority));
        }
        if self.parallel && self.subtasks.is_empty() {
            return Err(TaskValidationError::EmptySubtasks {
                task_id: self.task_id.clone(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        seen.insert(self.task_id.as_str());
        for sub in &self.subtasks {
            if !seen.insert(sub.task_id.as_str()) {
                return Err(TaskValidationError::DuplicateSubtaskId(sub.task_id.clone()));
            }
        }
        Ok(())
    }

    /// Materialize `subtasks` into full [`Task`]s, applying parent
    /// inheritance for every unset field.
    pub fn resolved_subtasks(&self) -> Vec<Task> {
        self.subtasks
            .iter()
            .map(|sub| Task {
                task_id: sub.task_id.clone(),
                task_type: sub.task_type.clone().unwrap_or_else(|| self.task_type.clone()),
                description: sub.description.clone().unwrap_or_else(|| self.description.clone()),
                files: sub.files.clone().unwrap_or_else(|| self.files.clone()),
                parallel: false,
                subtasks: Vec::new(),
                priority: sub.priority.unwrap_or(self.priority),
                timeout: sub.timeout.unwrap_or(self.timeout),
            })
            .collect()
    }
}

/// Outcome of dispatching a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The worker completed the task normally.
    Success,
    /// The worker reported a failure, or an operational error occurred.
    Failed,
    /// The task was aborted after exceeding its timeout.
    Timeout,
    /// A parallel task where some subtasks succeeded and others did not.
    Partial,
}

/// The result of dispatching a [`Task`], always returned to the submitter
/// instead of an exception for operational failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Echoes the originating task's id.
    pub task_id: String,
    /// The agent that ran the task, or `"none"` if rejected before assignment.
    pub agent_id: String,
    /// Outcome class.
    pub status: TaskStatus,
    /// Structured worker output; may be empty on failure.
    #[serde(default)]
    pub result: Map<String, Value>,
    /// Human-readable failure description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock seconds from dispatch to completion.
    pub execution_time: f64,
    /// Completion wall-clock time.
    pub timestamp: DateTime<Utc>,
}

/// Identity used for a `TaskResult.agent_id` when a task never reached
/// assignment (e.g. queue rejected, no agents available).
pub const NO_AGENT: &str = "none";

impl TaskResult {
    /// Build a `failed` result not attributable to any agent.
    pub fn rejected(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: NO_AGENT.to_string(),
            status: TaskStatus::Failed,
            result: Map::new(),
            error: Some(error.into()),
            execution_time: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_task() -> Task {
        Task {
            task_id: "t1".into(),
            task_type: TaskType::Generic,
            description: "echo hello".into(),
            files: vec![],
            parallel: false,
            subtasks: vec![],
            priority: 5,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let mut t = base_task();
        t.priority = 11;
        assert!(matches!(t.validate(), Err(TaskValidationError::PriorityOutOfRange(11))));
        t.priority = 0;
        assert!(matches!(t.validate(), Err(TaskValidationError::PriorityOutOfRange(0))));
    }

    #[test]
    fn parallel_without_subtasks_is_rejected() {
        let mut t = base_task();
        t.parallel = true;
        assert!(matches!(t.validate(), Err(TaskValidationError::EmptySubtasks { .. })));
    }

    #[test]
    fn duplicate_subtask_id_is_rejected() {
        let mut t = base_task();
        t.parallel = true;
        t.subtasks = vec![
            SubtaskSpec {
                task_id: "t1-a".into(),
                task_type: None,
                description: None,
                files: None,
                priority: None,
                timeout: None,
            },
            SubtaskSpec {
                task_id: "t1-a".into(),
                task_type: None,
                description: None,
                files: None,
                priority: None,
                timeout: None,
            },
        ];
        assert!(matches!(t.validate(), Err(TaskValidationError::DuplicateSubtaskId(_))));
    }

    #[test]
    fn resolved_subtasks_inherit_parent_defaults() {
        let mut t = base_task();
        t.priority = 7;
        t.subtasks = vec![SubtaskSpec {
            task_id: "t1-a".into(),
            task_type: Some(TaskType::Analysis),
            description: None,
            files: None,
            priority: None,
            timeout: None,
        }];
        let resolved = t.resolved_subtasks();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].task_type, TaskType::Analysis);
        assert_eq!(resolved[0].description, t.description);
        assert_eq!(resolved[0].priority, 7);
        assert_eq!(resolved[0].timeout, t.timeout);
    }

    #[test]
    fn subtask_can_override_timeout_beyond_parent() {
        let mut t = base_task();
        t.timeout = Duration::from_secs(10);
        t.subtasks = vec![SubtaskSpec {
            task_id: "t1-a".into(),
            task_type: None,
            description: None,
            files: None,
            priority: None,
            timeout: Some(Duration::from_secs(30)),
        }];
        let resolved = t.resolved_subtasks();
        assert_eq!(resolved[0].timeout, Duration::from_secs(30));
    }

    #[test]
    fn custom_task_type_round_trips() {
        let json = serde_json::json!({
            "task_id": "t1",
            "task_type": "deploy_preview",
            "description": "d",
            "priority": 5,
            "timeout": 10.0,
        });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.task_type, TaskType::Custom("deploy_preview".into()));
        assert_eq!(task.task_type.to_string(), "deploy_preview");
    }
}
