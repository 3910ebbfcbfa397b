//! Registry of live child processes, keyed by execution id.
//!
//! Each entry records the owning task id, so a stop request for one task
//! never touches another task's children even when a single executor runs
//! many tasks at once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the owner of a tracked process has been asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    None,
    /// SIGTERM to the process group.
    Graceful,
    /// SIGKILL to the process group.
    Forced,
}

struct TrackedProcess {
    task_id: String,
    pid: Option<u32>,
    stop_tx: watch::Sender<StopRequest>,
}

/// Shared, cheaply cloneable process table.
#[derive(Clone, Default)]
pub struct ProcessTable {
    entries: Arc<DashMap<String, TrackedProcess>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned child. The returned receiver is watched by the
    /// executor that owns the `Child` handle.
    pub(crate) fn register(
        &self,
        execution_id: &str,
        task_id: &str,
        pid: Option<u32>,
    ) -> watch::Receiver<StopRequest> {
        let (stop_tx, stop_rx) = watch::channel(StopRequest::None);
        self.entries.insert(
            execution_id.to_string(),
            TrackedProcess {
                task_id: task_id.to_string(),
                pid,
                stop_tx,
            },
        );
        debug!(task_id, execution_id, ?pid, "process tracked");
        stop_rx
    }

    pub(crate) fn unregister(&self, execution_id: &str) {
        self.entries.remove(execution_id);
    }

    /// Number of tracked processes belonging to `task_id`.
    pub fn running_count(&self, task_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().task_id == task_id)
            .count()
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    /// Pids of the tracked processes for `task_id`.
    pub fn pids(&self, task_id: &str) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|e| e.value().task_id == task_id)
            .filter_map(|e| e.value().pid)
            .collect()
    }

    /// Two-phase stop: graceful now, forced after `grace` for anything still
    /// tracked. `None` targets every task. Returns how many executions were
    /// signalled; does not wait for them to exit.
    pub fn request_stop(&self, task_id: Option<&str>, grace: Duration) -> usize {
        let targets: Vec<String> = self
            .entries
            .iter()
            .filter(|e| task_id.map_or(true, |id| e.value().task_id == id))
            .map(|e| {
                let _ = e.value().stop_tx.send(StopRequest::Graceful);
                e.key().clone()
            })
            .collect();

        if targets.is_empty() {
            return 0;
        }
        info!(
            task_id = task_id.unwrap_or("*"),
            count = targets.len(),
            grace_secs = grace.as_secs_f64(),
            "stop requested"
        );

        let entries = Arc::clone(&self.entries);
        let escalate = {
            let targets = targets.clone();
            move || {
                for execution_id in &targets {
                    if let Some(entry) = entries.get(execution_id) {
                        warn!(
                            task_id = %entry.task_id,
                            execution_id = %execution_id,
                            "process ignored graceful stop, forcing"
                        );
                        let _ = entry.stop_tx.send(StopRequest::Forced);
                    }
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    escalate();
                });
            }
            // No runtime to wait on: skip straight to the forced phase.
            Err(_) => escalate(),
        }

        targets.len()
    }
}
