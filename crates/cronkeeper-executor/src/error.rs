//! Error types for the cronkeeper-executor crate.
//!
//! None of these escape [`crate::TaskExecutor::execute`]: they are folded
//! into the failed `TaskExecution` record and the task log.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The log directory or file could not be created or written.
    #[error("log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Child-process spawn failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Underlying I/O failure while waiting on the child.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecutorError>;
