use std::path::PathBuf;

use cronkeeper_core::CoreError;
use thiserror::Error;

/// Errors from reading and writing `tasks/<id>/config.json`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The tasks root does not exist. Fatal at startup.
    #[error("Tasks directory not found: {}", .0.display())]
    RootMissing(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed JSON, a missing required field or an unknown field.
    #[error("Invalid JSON in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// `task_id` inside the file differs from its directory name.
    #[error("Task id {found:?} does not match directory {expected:?}")]
    IdMismatch { expected: String, found: String },
}

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task already exists: {id}")]
    TaskExists { id: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// The cron expression does not parse as a 5-field crontab.
    #[error("Invalid schedule {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error(transparent)]
    InvalidTask(CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Watcher error: {0}")]
    Watcher(String),
}

impl SchedulerError {
    /// Short error code string, handy for API collaborators.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::TaskExists { .. } => "TASK_EXISTS",
            SchedulerError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            SchedulerError::InvalidTask(_) => "INVALID_TASK",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Watcher(_) => "WATCHER_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
