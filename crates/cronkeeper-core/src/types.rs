use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Keys in `task_env` starting with this marker never reach the child process.
pub const INTERNAL_ENV_MARKER: char = '_';

/// Reserved `task_env` key naming a dotenv-style file merged in first.
pub const ENV_FILE_KEY: &str = "_ENV_FILE";

const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Notification preferences. Only read by the notifier collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotify {
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
}

/// A schedulable unit of work, stored as `tasks/<task_id>/config.json`.
///
/// Two tasks are equal iff every field is equal; the engine relies on this to
/// detect no-op updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub task_id: String,
    pub task_name: String,
    pub task_exec: String,
    /// Standard 5-field crontab expression.
    pub task_schedule: String,
    #[serde(default)]
    pub task_desc: String,
    /// Seconds before the process is killed. `None` means unbounded.
    #[serde(default)]
    pub task_timeout: Option<u64>,
    #[serde(default)]
    pub task_retry: u32,
    #[serde(default = "default_retry_interval")]
    pub task_retry_interval: u64,
    #[serde(default = "bool_true")]
    pub task_enabled: bool,
    /// Log file path. Empty means `<logs_dir>/task_<task_id>.log`.
    #[serde(default)]
    pub task_log: String,
    #[serde(default)]
    pub task_env: BTreeMap<String, String>,
    /// Reserved; not enforced by the scheduler.
    #[serde(default)]
    pub task_dependencies: Vec<String>,
    #[serde(default)]
    pub task_notify: TaskNotify,
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL_SECS
}

fn bool_true() -> bool {
    true
}

impl Task {
    /// Build a task with every optional field at its default.
    pub fn new(
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        task_exec: impl Into<String>,
        task_schedule: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            task_exec: task_exec.into(),
            task_schedule: task_schedule.into(),
            task_desc: String::new(),
            task_timeout: None,
            task_retry: 0,
            task_retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            task_enabled: true,
            task_log: String::new(),
            task_env: BTreeMap::new(),
            task_dependencies: Vec::new(),
            task_notify: TaskNotify::default(),
        }
    }

    /// `<logs_dir>/task_<task_id>.log`
    pub fn default_log_path(logs_dir: &Path, task_id: &str) -> String {
        logs_dir
            .join(format!("task_{task_id}.log"))
            .to_string_lossy()
            .into_owned()
    }

    /// Fill in `task_log` when it was left empty.
    pub fn with_default_log(mut self, logs_dir: &Path) -> Self {
        if self.task_log.trim().is_empty() {
            self.task_log = Self::default_log_path(logs_dir, &self.task_id);
        }
        self
    }

    /// True when a change to `other` requires the cron job to be rebuilt.
    pub fn has_critical_changes(&self, other: &Task) -> bool {
        self.task_enabled != other.task_enabled
            || self.task_schedule != other.task_schedule
            || self.task_exec != other.task_exec
    }

    /// Check the field-level invariants. The cron expression is checked
    /// separately by the scheduler when the job is registered.
    pub fn validate(&self) -> Result<()> {
        if self.task_id.is_empty() {
            return Err(CoreError::invalid(&self.task_id, "task_id is required"));
        }
        if !is_valid_task_id(&self.task_id) {
            return Err(CoreError::invalid(
                &self.task_id,
                "task_id may only contain letters, digits, '_' and '-'",
            ));
        }
        if self.task_name.trim().is_empty() {
            return Err(CoreError::invalid(&self.task_id, "task_name is required"));
        }
        if self.task_exec.trim().is_empty() {
            return Err(CoreError::invalid(&self.task_id, "task_exec is required"));
        }
        if self.task_timeout == Some(0) {
            return Err(CoreError::invalid(
                &self.task_id,
                "task_timeout must be positive",
            ));
        }
        if self.task_retry_interval == 0 {
            return Err(CoreError::invalid(
                &self.task_id,
                "task_retry_interval must be positive",
            ));
        }
        Ok(())
    }
}

/// `[A-Za-z0-9_-]+`
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// TaskPatch
// ---------------------------------------------------------------------------

/// Partial update: every field that is `Some` replaces the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPatch {
    pub task_name: Option<String>,
    pub task_exec: Option<String>,
    pub task_schedule: Option<String>,
    pub task_desc: Option<String>,
    /// `Some(None)` clears the timeout.
    #[serde(default, with = "double_option")]
    pub task_timeout: Option<Option<u64>>,
    pub task_retry: Option<u32>,
    pub task_retry_interval: Option<u64>,
    pub task_enabled: Option<bool>,
    pub task_log: Option<String>,
    pub task_env: Option<BTreeMap<String, String>>,
    pub task_dependencies: Option<Vec<String>>,
    pub task_notify: Option<TaskNotify>,
}

impl TaskPatch {
    /// Merge the explicit fields over `current`, producing a full candidate.
    pub fn apply(&self, current: &Task) -> Task {
        let mut next = current.clone();
        if let Some(v) = &self.task_name {
            next.task_name = v.clone();
        }
        if let Some(v) = &self.task_exec {
            next.task_exec = v.clone();
        }
        if let Some(v) = &self.task_schedule {
            next.task_schedule = v.clone();
        }
        if let Some(v) = &self.task_desc {
            next.task_desc = v.clone();
        }
        if let Some(v) = self.task_timeout {
            next.task_timeout = v;
        }
        if let Some(v) = self.task_retry {
            next.task_retry = v;
        }
        if let Some(v) = self.task_retry_interval {
            next.task_retry_interval = v;
        }
        if let Some(v) = self.task_enabled {
            next.task_enabled = v;
        }
        if let Some(v) = &self.task_log {
            next.task_log = v.clone();
        }
        if let Some(v) = &self.task_env {
            next.task_env = v.clone();
        }
        if let Some(v) = &self.task_dependencies {
            next.task_dependencies = v.clone();
        }
        if let Some(v) = &self.task_notify {
            next.task_notify = v.clone();
        }
        next
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<u64>>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.serialize(s)
    }

    // A present-but-null field becomes Some(None); an absent one stays None
    // thanks to #[serde(default)].
    pub fn deserialize<'de, D>(d: D) -> Result<Option<Option<u64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(d).map(Some)
    }
}

// ---------------------------------------------------------------------------
// TaskView
// ---------------------------------------------------------------------------

/// Read-side projection returned by `list_tasks` / `get_task`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub next_run_time: Option<DateTime<Local>>,
}

// ---------------------------------------------------------------------------
// TaskExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    /// Stopped on purpose (SIGTERM or an explicit stop request). Never retried.
    Terminated,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// One run attempt of a task. Lives only in memory; the log file is the
/// durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub execution_id: String,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub status: ExecutionStatus,
    /// `None` when the process was killed by a signal or never started.
    pub return_code: Option<i32>,
    pub output: String,
    pub error_message: Option<String>,
    /// Seconds, set once the execution is finalised.
    pub duration: Option<f64>,
}

impl TaskExecution {
    /// Fresh record in the `Running` state with a new UUIDv4 execution id.
    pub fn start(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            start_time: Local::now(),
            end_time: None,
            status: ExecutionStatus::Running,
            return_code: None,
            output: String::new(),
            error_message: None,
            duration: None,
        }
    }

    /// Stamp `end_time` and `duration`.
    pub fn finish(&mut self) {
        let end = Local::now();
        let elapsed = end.signed_duration_since(self.start_time);
        self.duration = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
        self.end_time = Some(end);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new("backup", "Nightly backup", "sh backup.sh", "0 3 * * *")
    }

    #[test]
    fn defaults_applied_on_deserialize() {
        let json = r#"{
            "task_id": "t1",
            "task_name": "One",
            "task_exec": "echo hi",
            "task_schedule": "*/5 * * * *"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_retry, 0);
        assert_eq!(task.task_retry_interval, 60);
        assert!(task.task_enabled);
        assert_eq!(task.task_timeout, None);
        assert!(!task.task_notify.on_failure);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let json = r#"{
            "task_id": "t1",
            "task_name": "One",
            "task_exec": "echo hi",
            "task_schedule": "* * * * *",
            "task_colour": "blue"
        }"#;
        assert!(serde_json::from_str::<Task>(json).is_err());
    }

    #[test]
    fn critical_changes_only_for_schedule_exec_enabled() {
        let a = sample();

        let mut b = a.clone();
        b.task_desc = "changed".into();
        b.task_retry = 5;
        assert!(!a.has_critical_changes(&b));

        let mut c = a.clone();
        c.task_schedule = "0 4 * * *".into();
        assert!(a.has_critical_changes(&c));

        let mut d = a.clone();
        d.task_enabled = false;
        assert!(a.has_critical_changes(&d));

        let mut e = a.clone();
        e.task_exec = "sh other.sh".into();
        assert!(a.has_critical_changes(&e));
    }

    #[test]
    fn validate_rejects_bad_fields() {
        assert!(sample().validate().is_ok());

        let mut t = sample();
        t.task_id = "has space".into();
        assert!(t.validate().is_err());

        let mut t = sample();
        t.task_exec = "  ".into();
        assert!(t.validate().is_err());

        let mut t = sample();
        t.task_timeout = Some(0);
        assert!(t.validate().is_err());

        let mut t = sample();
        t.task_retry_interval = 0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn default_log_path_only_fills_empty() {
        let dir = Path::new("logs");
        let t = sample().with_default_log(dir);
        assert!(t.task_log.ends_with("task_backup.log"));

        let mut custom = sample();
        custom.task_log = "/var/log/backup.log".into();
        let custom = custom.with_default_log(dir);
        assert_eq!(custom.task_log, "/var/log/backup.log");
    }

    #[test]
    fn patch_merges_only_explicit_fields() {
        let current = sample();
        let patch: TaskPatch =
            serde_json::from_str(r#"{"task_retry": 3, "task_timeout": null}"#).unwrap();
        let mut with_timeout = current.clone();
        with_timeout.task_timeout = Some(30);

        let next = patch.apply(&with_timeout);
        assert_eq!(next.task_retry, 3);
        assert_eq!(next.task_timeout, None);
        assert_eq!(next.task_name, current.task_name);
        assert_eq!(next.task_schedule, current.task_schedule);

        let untouched = TaskPatch::default().apply(&with_timeout);
        assert_eq!(untouched, with_timeout);
    }

    #[test]
    fn view_serializes_flat() {
        let view = TaskView {
            task: sample(),
            next_run_time: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["task_id"], "backup");
        assert!(json["next_run_time"].is_null());
    }

    #[test]
    fn execution_finish_sets_duration() {
        let mut exec = TaskExecution::start("backup");
        assert_eq!(exec.status, ExecutionStatus::Running);
        exec.finish();
        assert!(exec.end_time.is_some());
        assert!(exec.duration.unwrap() >= 0.0);
    }
}
