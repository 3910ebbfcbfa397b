//! `cronkeeper-core` — shared data model, configuration and error types.
//!
//! Every other crate in the workspace depends on this one. It owns no
//! runtime state: the [`types::Task`] definition, the per-attempt
//! [`types::TaskExecution`] record and the figment-backed
//! [`config::CronkeeperConfig`] live here.

pub mod config;
pub mod error;
pub mod types;

pub use config::CronkeeperConfig;
pub use error::{CoreError, Result};
pub use types::{
    ExecutionStatus, Task, TaskExecution, TaskNotify, TaskPatch, TaskView, ENV_FILE_KEY,
    INTERNAL_ENV_MARKER,
};
