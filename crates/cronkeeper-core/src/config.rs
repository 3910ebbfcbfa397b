use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "cronkeeper.toml";
pub const CONFIG_ENV_VAR: &str = "CRONKEEPER_CONFIG";
pub const ENV_PREFIX: &str = "CRONKEEPER_";

/// Top-level config (cronkeeper.toml + CRONKEEPER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronkeeperConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub watcher: WatcherSection,
    #[serde(default)]
    pub executor: ExecutorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// One subdirectory per task, each holding `config.json`.
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Executions kept in memory per task.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// A second update for the same task inside this window is dropped.
    #[serde(default = "default_dedup_ms")]
    pub update_dedup_window_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping a task's processes.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tasks_dir: default_tasks_dir(),
            logs_dir: default_logs_dir(),
            history_limit: default_history_limit(),
            update_dedup_window_ms: default_dedup_ms(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl SchedulerSection {
    pub fn update_dedup_window(&self) -> Duration {
        Duration::from_millis(self.update_dedup_window_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Which backend keeps the registry in sync with `tasks_dir`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatcherMode {
    /// Filesystem notifications (inotify / FSEvents / ReadDirectoryChangesW).
    #[default]
    Event,
    /// Timed mtime comparison; use on network and overlay mounts.
    Polling,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSection {
    #[serde(default)]
    pub mode: WatcherMode,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_event_suppress")]
    pub event_suppress_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_suppress")]
    pub poll_suppress_secs: u64,
    #[serde(default = "default_mtime_epsilon_ms")]
    pub mtime_epsilon_ms: u64,
    /// Consecutive polls with a missing tasks root before it is reported.
    #[serde(default = "default_missing_root_tolerance")]
    pub missing_root_tolerance: u32,
    #[serde(default = "default_delete_confirm_ms")]
    pub delete_confirm_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            mode: WatcherMode::default(),
            debounce_ms: default_debounce_ms(),
            settle_ms: default_settle_ms(),
            event_suppress_secs: default_event_suppress(),
            poll_interval_secs: default_poll_interval(),
            poll_suppress_secs: default_poll_suppress(),
            mtime_epsilon_ms: default_mtime_epsilon_ms(),
            missing_root_tolerance: default_missing_root_tolerance(),
            delete_confirm_ms: default_delete_confirm_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Cap on the output kept in the in-memory execution record.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_tasks_dir() -> PathBuf {
    PathBuf::from("tasks")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_history_limit() -> usize {
    50
}
fn default_dedup_ms() -> u64 {
    1_000
}
fn default_stop_grace() -> u64 {
    5
}
fn default_debounce_ms() -> u64 {
    1_000
}
fn default_settle_ms() -> u64 {
    500
}
fn default_event_suppress() -> u64 {
    2
}
fn default_poll_interval() -> u64 {
    5
}
fn default_poll_suppress() -> u64 {
    5
}
fn default_mtime_epsilon_ms() -> u64 {
    100
}
fn default_missing_root_tolerance() -> u32 {
    3
}
fn default_delete_confirm_ms() -> u64 {
    1_000
}
fn default_max_output_chars() -> usize {
    30_000
}

impl CronkeeperConfig {
    /// Load config from a TOML file with CRONKEEPER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `$CRONKEEPER_CONFIG`
    ///   3. `./cronkeeper.toml`
    ///
    /// A missing file is not an error; defaults fill every gap. Nested keys
    /// use a double underscore: `CRONKEEPER_WATCHER__MODE=polling`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        Figment::from(Serialized::defaults(CronkeeperConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config"]))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}
