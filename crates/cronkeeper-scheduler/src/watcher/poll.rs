//! Polling backend: periodic mtime comparison of every `*/config.json`.
//!
//! Meant for mounts where notifications are unreliable (NFS, SMB, overlay
//! file systems in containers).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ApiWriteClock, WatchEvent, WatcherSettings};
use crate::cron::cancelled;
use crate::store::CONFIG_FILE;

/// task id → (config path, mtime)
pub(crate) type Snapshot = HashMap<String, (PathBuf, SystemTime)>;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Changes {
    pub changed: Vec<PathBuf>,
    pub removed: Vec<String>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// `Ok(None)` when the root itself is missing.
pub(crate) fn scan(root: &Path) -> std::io::Result<Option<Snapshot>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut snapshot = Snapshot::new();
    for entry in entries.flatten() {
        let Some(task_id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let path = entry.path().join(CONFIG_FILE);
        if let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) {
            snapshot.insert(task_id, (path, modified));
        }
    }
    Ok(Some(snapshot))
}

pub(crate) fn diff(previous: &Snapshot, current: &Snapshot, epsilon: Duration) -> Changes {
    let mut changes = Changes::default();
    for (task_id, (path, mtime)) in current {
        match previous.get(task_id) {
            None => changes.changed.push(path.clone()),
            Some((_, old)) if mtime_delta(*old, *mtime) >= epsilon => {
                changes.changed.push(path.clone())
            }
            Some(_) => {}
        }
    }
    for task_id in previous.keys() {
        if !current.contains_key(task_id) {
            changes.removed.push(task_id.clone());
        }
    }
    changes.changed.sort();
    changes.removed.sort();
    changes
}

fn mtime_delta(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or_default()
}

pub(crate) fn spawn(
    root: PathBuf,
    settings: WatcherSettings,
    clock: ApiWriteClock,
    tx: mpsc::UnboundedSender<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    // Baseline taken before returning, so anything written after `spawn`
    // shows up in the first diff.
    let mut snapshot = match scan(&root) {
        Ok(Some(s)) => s,
        Ok(None) => Snapshot::new(),
        Err(e) => {
            warn!(root = %root.display(), "initial scan failed: {e}");
            Snapshot::new()
        }
    };
    info!(
        root = %root.display(),
        interval_secs = settings.poll_interval.as_secs(),
        tasks = snapshot.len(),
        "polling watcher started"
    );

    tokio::spawn(async move {
        let mut missing_polls = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                _ = cancelled(&mut shutdown) => break,
            }

            let current = match scan(&root) {
                Ok(Some(current)) => {
                    if missing_polls > 0 {
                        info!(root = %root.display(), "tasks directory is back");
                    }
                    missing_polls = 0;
                    current
                }
                Ok(None) => {
                    // Never read as "every task deleted": keep the old snapshot.
                    missing_polls += 1;
                    if missing_polls >= settings.missing_root_tolerance {
                        error!(
                            root = %root.display(),
                            polls = missing_polls,
                            "tasks directory missing"
                        );
                    } else {
                        warn!(
                            root = %root.display(),
                            polls = missing_polls,
                            "tasks directory not visible"
                        );
                    }
                    continue;
                }
                Err(e) => {
                    warn!(root = %root.display(), "scan failed: {e}");
                    continue;
                }
            };

            let mut changes = diff(&snapshot, &current, settings.mtime_epsilon);
            if changes.is_empty() {
                snapshot = current;
                continue;
            }
            if clock.within(settings.suppress) {
                info!(
                    changed = changes.changed.len(),
                    removed = changes.removed.len(),
                    "changes follow an API write, refreshing snapshot only"
                );
                snapshot = current;
                continue;
            }

            let mut next = current;
            if !changes.removed.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(settings.delete_confirm) => {}
                    _ = cancelled(&mut shutdown) => break,
                }
                let (confirmed, transient): (Vec<String>, Vec<String>) = changes
                    .removed
                    .drain(..)
                    .partition(|id| !root.join(id).join(CONFIG_FILE).exists());
                for task_id in transient {
                    debug!(task_id = %task_id, "config reappeared, not a deletion");
                    if let Some(entry) = snapshot.get(&task_id) {
                        next.insert(task_id, entry.clone());
                    }
                }
                changes.removed = confirmed;
            }
            snapshot = next;

            for path in changes.changed {
                debug!(path = %path.display(), "config changed on disk");
                if tx.send(WatchEvent::ConfigChanged(path)).is_err() {
                    return;
                }
            }
            if !changes.removed.is_empty() {
                info!(tasks = ?changes.removed, "task configs deleted on disk");
                if tx.send(WatchEvent::BulkChange).is_err() {
                    return;
                }
            }
        }
        info!("polling watcher stopped");
    })
}
