//! cronkeeper-executor — runs one task attempt as a child process.
//!
//! The executor knows nothing about schedules or retries. Given a
//! [`cronkeeper_core::Task`] it:
//! - builds the child environment (`env`)
//! - decides between a direct interpreter invocation and `sh -c` (`command`)
//! - streams combined stdout/stderr into the task log between start and end
//!   banners (`banner`)
//! - enforces `task_timeout` and honours stop requests (`process`)
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cronkeeper_core::Task;
//! use cronkeeper_executor::{ExecutorOptions, TaskExecutor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = TaskExecutor::new(ExecutorOptions::default());
//!     let task = Task::new("hello", "Hello", "echo hello", "* * * * *")
//!         .with_default_log(std::path::Path::new("logs"));
//!     let execution = executor.execute(&task).await;
//!     println!("{} {:?}", execution.status, execution.return_code);
//! }
//! ```

pub mod banner;
pub mod command;
pub mod env;
pub mod error;
pub mod executor;
pub mod process;
pub mod truncate;

pub use command::CommandSpec;
pub use error::{ExecutorError, Result};
pub use executor::{ExecutorOptions, TaskExecutor};
pub use process::{ProcessTable, StopRequest};
