//! Child-process environment construction.
//!
//! Precedence, lowest first: the scheduler's own environment, the optional
//! `_ENV_FILE`, the task's `task_env`, then `TASK_ID` / `TASK_LOG`. Keys that
//! start with the internal marker are removed last.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

use cronkeeper_core::{Task, ENV_FILE_KEY, INTERNAL_ENV_MARKER};
use tracing::{error, info, warn};

/// Build the environment for `task` on top of the current process env.
pub fn build_environment(task: &Task) -> BTreeMap<String, String> {
    build_environment_from(utf8_vars(std::env::vars_os()), task)
}

/// Keep the UTF-8 entries of an OS environment; the rest are logged and
/// dropped.
pub fn utf8_vars<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (key, _) => {
                let key = key.unwrap_or_else(|raw| raw.to_string_lossy().into_owned());
                warn!(key = %key, "skipping environment variable that is not valid UTF-8");
                None
            }
        })
        .collect()
}

/// Same as [`build_environment`] with an explicit base (used by tests).
pub fn build_environment_from<I>(base: I, task: &Task) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base.into_iter().collect();

    if let Some(env_file) = task.task_env.get(ENV_FILE_KEY) {
        merge_env_file(&mut env, &task.task_id, Path::new(env_file));
    }

    env.extend(
        task.task_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env.insert("TASK_ID".to_string(), task.task_id.clone());
    env.insert("TASK_LOG".to_string(), task.task_log.clone());

    env.retain(|k, _| !k.starts_with(INTERNAL_ENV_MARKER));
    env
}

fn merge_env_file(env: &mut BTreeMap<String, String>, task_id: &str, path: &Path) {
    if !path.exists() {
        warn!(task_id, path = %path.display(), "env file not found, skipping");
        return;
    }

    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) => {
            error!(task_id, path = %path.display(), "failed to open env file: {e}");
            return;
        }
    };

    let mut loaded = 0usize;
    for item in iter {
        match item {
            Ok((key, value)) => {
                env.insert(key, value);
                loaded += 1;
            }
            Err(e) => {
                error!(task_id, path = %path.display(), "failed to parse env file: {e}");
                return;
            }
        }
    }
    info!(task_id, path = %path.display(), count = loaded, "loaded env file");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn task_with_env(pairs: &[(&str, &str)]) -> Task {
        let mut task = Task::new("envtask", "Env", "env", "* * * * *");
        task.task_log = "logs/task_envtask.log".into();
        for (k, v) in pairs {
            task.task_env.insert(k.to_string(), v.to_string());
        }
        task
    }

    fn base() -> Vec<(String, String)> {
        vec![
            ("PATH".into(), "/usr/bin".into()),
            ("SHARED".into(), "from-process".into()),
            ("_SECRET".into(), "hidden".into()),
        ]
    }

    #[test]
    fn task_env_overrides_process_env_and_injects_ids() {
        let task = task_with_env(&[("SHARED", "from-task"), ("EXTRA", "1")]);
        let env = build_environment_from(base(), &task);

        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["SHARED"], "from-task");
        assert_eq!(env["EXTRA"], "1");
        assert_eq!(env["TASK_ID"], "envtask");
        assert_eq!(env["TASK_LOG"], "logs/task_envtask.log");
    }

    #[test]
    fn internal_keys_are_stripped() {
        let task = task_with_env(&[("_NOTE", "internal"), ("VISIBLE", "yes")]);
        let env = build_environment_from(base(), &task);

        assert!(env.keys().all(|k| !k.starts_with('_')));
        assert_eq!(env["VISIBLE"], "yes");
    }

    #[test]
    fn env_file_is_merged_below_task_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.env");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "FROM_FILE=file").unwrap();
        writeln!(f, "SHARED=from-file").unwrap();
        drop(f);

        let path_str = path.to_string_lossy().into_owned();
        let task = task_with_env(&[(ENV_FILE_KEY, path_str.as_str()), ("SHARED", "from-task")]);
        let env = build_environment_from(base(), &task);

        assert_eq!(env["FROM_FILE"], "file");
        assert_eq!(env["SHARED"], "from-task");
        assert!(!env.contains_key(ENV_FILE_KEY));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_process_vars_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from("GOOD"), OsString::from("yes")),
            (OsString::from("BAD_VALUE"), OsString::from_vec(b"\xff\xfe".to_vec())),
            (OsString::from_vec(b"BAD_\xffKEY".to_vec()), OsString::from("x")),
        ];
        let kept = utf8_vars(vars);
        assert_eq!(kept, vec![("GOOD".to_string(), "yes".to_string())]);

        let env = build_environment_from(kept, &task_with_env(&[]));
        assert_eq!(env["GOOD"], "yes");
        assert!(!env.contains_key("BAD_VALUE"));
    }

    #[test]
    fn missing_env_file_is_not_fatal() {
        let task = task_with_env(&[(ENV_FILE_KEY, "/nonexistent/cronkeeper.env")]);
        let env = build_environment_from(base(), &task);
        assert_eq!(env["TASK_ID"], "envtask");
    }
}
