//! `cronkeeper-scheduler` — cron scheduling engine over on-disk task configs.
//!
//! # Overview
//!
//! Task definitions live in `tasks/<task_id>/config.json` ([`store`]). The
//! [`engine::SchedulerEngine`] keeps them in an in-memory registry, runs one
//! cron loop per enabled task ([`cron`]), wraps each firing in the exit-code
//! retry policy ([`retry`]) and follows hand edits on disk through a
//! [`watcher`] backend.
//!
//! # Exit codes
//!
//! | Code          | Meaning                        |
//! |---------------|--------------------------------|
//! | `0`           | success                        |
//! | `1`           | business failure, never retried |
//! | anything else | retried up to `task_retry` times |

pub mod cron;
pub mod engine;
pub mod error;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod watcher;

pub use engine::{ReconcileReport, SchedulerEngine, UpdateOutcome};
pub use error::{Result, SchedulerError, StoreError};
pub use retry::{RetryDecision, RetryOutcome};
pub use schedule::{CronSchedule, FixedInterval, Trigger};
pub use store::TaskStore;
pub use watcher::{ApiWriteClock, WatchEvent, Watcher};
