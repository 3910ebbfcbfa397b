//! On-disk task definitions: `tasks/<task_id>/config.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use cronkeeper_core::types::is_valid_task_id;
use cronkeeper_core::Task;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;

pub const CONFIG_FILE: &str = "config.json";
const TMP_SUFFIX: &str = ".tmp";

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_dir: PathBuf,
    logs_dir: PathBuf,
}

impl TaskStore {
    pub fn new(tasks_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn config_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id).join(CONFIG_FILE)
    }

    /// Every loadable task, sorted by id. Broken tasks are logged and skipped;
    /// only a missing tasks root is an error.
    pub fn load_all(&self) -> Result<Vec<Task>> {
        if !self.tasks_dir.is_dir() {
            return Err(StoreError::RootMissing(self.tasks_dir.clone()));
        }
        let entries = std::fs::read_dir(&self.tasks_dir).map_err(|source| StoreError::Read {
            path: self.tasks_dir.clone(),
            source,
        })?;

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(task_id) = name.to_str() else {
                warn!(dir = ?name, "skipping task directory with non-UTF-8 name");
                continue;
            };
            if !is_valid_task_id(task_id) {
                warn!(dir = task_id, "skipping directory that is not a valid task id");
                continue;
            }
            match self.load_one(task_id) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => warn!(task_id, "task directory has no {CONFIG_FILE}, skipping"),
                Err(e) => error!(task_id, "failed to load task: {e}"),
            }
        }

        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        info!(count = tasks.len(), dir = %self.tasks_dir.display(), "tasks loaded");
        Ok(tasks)
    }

    /// `Ok(None)` when the config file does not exist.
    pub fn load_one(&self, task_id: &str) -> Result<Option<Task>> {
        let path = self.config_path(task_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let task: Task =
            serde_json::from_str(&raw).map_err(|source| StoreError::Parse { path, source })?;
        if task.task_id != task_id {
            return Err(StoreError::IdMismatch {
                expected: task_id.to_string(),
                found: task.task_id,
            });
        }
        let task = task.with_default_log(&self.logs_dir);
        task.validate()?;
        Ok(Some(task))
    }

    /// Write pretty JSON through a temp file and a rename, so readers never
    /// see a partial file.
    pub fn save_one(&self, task: &Task) -> Result<()> {
        let dir = self.tasks_dir.join(&task.task_id);
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(CONFIG_FILE);
        let tmp = dir.join(format!("{CONFIG_FILE}{TMP_SUFFIX}"));
        let mut body = serde_json::to_string_pretty(task).map_err(|e| StoreError::Write {
            path: path.clone(),
            source: e.into(),
        })?;
        body.push('\n');

        std::fs::write(&tmp, body).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(task_id = %task.task_id, path = %path.display(), "task saved");
        Ok(())
    }

    /// Remove the task directory. Already gone is fine.
    pub fn delete_all(&self, task_id: &str) -> Result<()> {
        let dir = self.tasks_dir.join(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(task_id, "task directory deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write { path: dir, source }),
        }
    }

    /// Task id for a `<tasks_dir>/<id>/config.json` path, else `None`.
    pub fn task_id_for_path(&self, path: &Path) -> Option<String> {
        if path.file_name()? != CONFIG_FILE {
            return None;
        }
        let task_dir = path.parent()?;
        let task_id = task_dir.file_name()?.to_str()?;
        if !is_valid_task_id(task_id) {
            return None;
        }
        let root = task_dir.parent()?;
        if root == self.tasks_dir || root.ends_with(&self.tasks_dir) || self.same_root(root) {
            Some(task_id.to_string())
        } else {
            None
        }
    }

    fn same_root(&self, other: &Path) -> bool {
        match (other.canonicalize(), self.tasks_dir.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
