//! Keeps the registry in sync with hand edits under `tasks_dir`.
//!
//! Backends only *report* changes as [`WatchEvent`]s on a channel; the engine
//! owns the dispatch loop that turns them into reloads.

pub mod event;
pub mod poll;
pub mod suppress;

use std::path::PathBuf;
use std::time::Duration;

use cronkeeper_core::config::{WatcherMode, WatcherSection};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;

pub use suppress::ApiWriteClock;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A task's `config.json` was created or modified.
    ConfigChanged(PathBuf),
    /// Something was removed or renamed; only a full reconcile is safe.
    BulkChange,
}

/// Backend timings, resolved from [`WatcherSection`].
#[derive(Debug, Clone, Copy)]
pub struct WatcherSettings {
    pub debounce: Duration,
    pub settle: Duration,
    /// Suppression window for the active backend.
    pub suppress: Duration,
    pub poll_interval: Duration,
    pub mtime_epsilon: Duration,
    pub missing_root_tolerance: u32,
    pub delete_confirm: Duration,
}

impl WatcherSettings {
    pub fn from_section(section: &WatcherSection, mode: WatcherMode) -> Self {
        let suppress_secs = match mode {
            WatcherMode::Polling => section.poll_suppress_secs,
            _ => section.event_suppress_secs,
        };
        Self {
            debounce: Duration::from_millis(section.debounce_ms),
            settle: Duration::from_millis(section.settle_ms),
            suppress: Duration::from_secs(suppress_secs),
            poll_interval: Duration::from_secs(section.poll_interval_secs),
            mtime_epsilon: Duration::from_millis(section.mtime_epsilon_ms),
            missing_root_tolerance: section.missing_root_tolerance,
            delete_confirm: Duration::from_millis(section.delete_confirm_ms),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self::from_section(&WatcherSection::default(), WatcherMode::Event)
    }
}

/// A running backend.
pub struct Watcher {
    mode: WatcherMode,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Watcher {
    /// Start the backend for `mode`. `Disabled` yields `Ok(None)`.
    ///
    /// If the notification backend cannot be set up (inotify limits,
    /// unsupported file system) the polling backend is used instead.
    pub fn start(
        mode: WatcherMode,
        root: PathBuf,
        section: &WatcherSection,
        clock: ApiWriteClock,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Option<Self>> {
        let root = root.canonicalize().unwrap_or(root);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (mode, handle) = match mode {
            WatcherMode::Disabled => {
                info!("config watcher disabled");
                return Ok(None);
            }
            WatcherMode::Event => {
                let settings = WatcherSettings::from_section(section, WatcherMode::Event);
                let spawned = event::spawn(
                    root.clone(),
                    settings,
                    clock.clone(),
                    tx.clone(),
                    shutdown_rx.clone(),
                );
                match spawned {
                    Ok(handle) => (WatcherMode::Event, handle),
                    Err(e) => {
                        warn!("event watcher unavailable ({e}), falling back to polling");
                        let settings = WatcherSettings::from_section(section, WatcherMode::Polling);
                        let handle = poll::spawn(root, settings, clock, tx, shutdown_rx);
                        (WatcherMode::Polling, handle)
                    }
                }
            }
            WatcherMode::Polling => {
                let settings = WatcherSettings::from_section(section, WatcherMode::Polling);
                (WatcherMode::Polling, poll::spawn(root, settings, clock, tx, shutdown_rx))
            }
        };

        Ok(Some(Self {
            mode,
            shutdown,
            handle,
        }))
    }

    /// The backend actually running (after any fallback).
    pub fn mode(&self) -> WatcherMode {
        self.mode
    }

    /// Signal the backend and wait for it, at most five seconds.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            warn!("config watcher did not stop in time, aborting");
            handle.abort();
        }
    }
}
