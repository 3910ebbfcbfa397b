#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use cronkeeper_core::config::WatcherMode;
use cronkeeper_core::{CronkeeperConfig, Task};
use cronkeeper_scheduler::SchedulerEngine;
use tempfile::TempDir;

/// Fires once a year; keeps cron loops idle during tests.
pub const NEVER_IN_TESTS: &str = "0 0 1 1 *";

pub struct Fixture {
    pub dir: TempDir,
    pub engine: SchedulerEngine,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(customise: impl FnOnce(&mut CronkeeperConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tasks")).unwrap();
        let mut config = test_config(dir.path());
        customise(&mut config);
        let engine = SchedulerEngine::new(config);
        Self { dir, engine }
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.dir.path().join("tasks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    /// Write a task definition straight to disk, bypassing the engine.
    pub fn write_on_disk(&self, task: &Task) {
        let dir = self.tasks_dir().join(&task.task_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.json"),
            serde_json::to_string_pretty(task).unwrap(),
        )
        .unwrap();
    }

    pub fn remove_on_disk(&self, task_id: &str) {
        std::fs::remove_dir_all(self.tasks_dir().join(task_id)).unwrap();
    }
}

pub fn test_config(root: &Path) -> CronkeeperConfig {
    let mut config = CronkeeperConfig::default();
    config.scheduler.tasks_dir = root.join("tasks");
    config.scheduler.logs_dir = root.join("logs");
    config.scheduler.stop_grace_secs = 1;
    config.watcher.mode = WatcherMode::Disabled;
    config
}

pub fn task(id: &str, exec: &str) -> Task {
    Task::new(id, format!("Task {id}"), exec, NEVER_IN_TESTS)
}

/// Poll `check` every 50 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
