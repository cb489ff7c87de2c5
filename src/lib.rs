//! Multi-agent CLI-session orchestration kernel: a broker channel, a wire
//! protocol, per-agent isolated container workspaces, a priority task
//! queue, a dispatcher, and the supervisor that ties them together.
//!
//! `main.rs` is a thin CLI shell around [`supervisor::Supervisor`]; the
//! pieces here are usable as a library for anything that wants to embed
//! the orchestrator (an integration test, an alternate front end).

pub mod agent;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod supervisor;
pub mod task;
pub mod workspace;

pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use supervisor::Supervisor;
pub use task::{Task, TaskResult, TaskStatus, TaskType};
