//! File-system notification backend built on `notify`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ApiWriteClock, WatchEvent, WatcherSettings};
use crate::cron::cancelled;
use crate::error::{Result, SchedulerError};
use crate::store::CONFIG_FILE;

pub(crate) fn spawn(
    root: PathBuf,
    settings: WatcherSettings,
    clock: ApiWriteClock,
    tx: mpsc::UnboundedSender<WatchEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = raw_tx.send(res);
    })
    .map_err(|e| SchedulerError::Watcher(e.to_string()))?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| SchedulerError::Watcher(format!("{}: {e}", root.display())))?;
    info!(root = %root.display(), "event watcher started");

    let handle = tokio::spawn(async move {
        // Dropping the watcher stops the notification thread.
        let _watcher = watcher;
        let mut last_seen: HashMap<PathBuf, Instant> = HashMap::new();

        'events: loop {
            let res = tokio::select! {
                res = raw_rx.recv() => res,
                _ = cancelled(&mut shutdown) => break,
            };
            let Some(res) = res else { break };
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("file watcher error: {e}");
                    continue;
                }
            };

            for change in classify(&root, &event) {
                let key = match &change {
                    WatchEvent::ConfigChanged(path) => path.clone(),
                    WatchEvent::BulkChange => root.clone(),
                };
                let now = Instant::now();
                last_seen.retain(|_, seen| now.duration_since(*seen) < settings.debounce);
                if last_seen.contains_key(&key) {
                    debug!(path = %key.display(), "duplicate change within debounce window");
                    continue;
                }
                last_seen.insert(key, now);

                // Let the writer finish before anyone reads the file.
                tokio::select! {
                    _ = tokio::time::sleep(settings.settle) => {}
                    _ = cancelled(&mut shutdown) => break 'events,
                }

                if clock.within(settings.suppress) {
                    debug!(?change, "change follows an API write, ignoring");
                    continue;
                }
                if tx.send(change).is_err() {
                    break 'events;
                }
            }
        }
        info!("event watcher stopped");
    });
    Ok(handle)
}

/// Map a raw notification onto the watcher contract.
fn classify(root: &Path, event: &Event) -> Vec<WatchEvent> {
    let is_config = |p: &PathBuf| p.file_name().is_some_and(|n| n == CONFIG_FILE);
    let is_task_dir = |p: &PathBuf| p.parent() == Some(root);

    let mut out = Vec::new();
    match &event.kind {
        EventKind::Remove(_) => out.push(WatchEvent::BulkChange),
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in &event.paths {
                if is_config(path) {
                    out.push(WatchEvent::ConfigChanged(path.clone()));
                } else if is_task_dir(path) {
                    out.push(WatchEvent::BulkChange);
                }
            }
        }
        EventKind::Create(kind) => {
            for path in &event.paths {
                if is_config(path) {
                    out.push(WatchEvent::ConfigChanged(path.clone()));
                } else if is_task_dir(path)
                    && (matches!(kind, CreateKind::Folder) || path.is_dir())
                {
                    out.push(WatchEvent::BulkChange);
                }
            }
        }
        EventKind::Modify(_) => {
            out.extend(
                event
                    .paths
                    .iter()
                    .filter(|&p| is_config(p))
                    .cloned()
                    .map(WatchEvent::ConfigChanged),
            );
        }
        _ => {}
    }
    out.dedup();
    out
}
