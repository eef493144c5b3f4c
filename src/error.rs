#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

use crate::task::model::TaskStatus;

#[derive(Debug, Error)]
pub enum NightshiftError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("plan references unknown tool server '{0}'")]
    UnknownTool(String),

    #[error("planning exceeded {0}s wall-clock limit")]
    PlannerTimeout(u64),

    #[error("failed to launch agent subprocess: {0}")]
    LaunchFailed(String),

    #[error("refusing to allow writes to system directory: {}", .0.display())]
    DangerousPath(PathBuf),

    #[error("task {task_id} has no live process (status: {status})")]
    NotRunning { task_id: String, status: TaskStatus },

    #[error("agent subprocess failed: {0}")]
    AgentFailure(String),

    #[error("task exceeded timeout of {0}s")]
    TimeoutExceeded(u64),

    #[error("failed to persist notification: {0}")]
    Notifier(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("executor already running (pid {0})")]
    ExecutorRunning(u32),

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
