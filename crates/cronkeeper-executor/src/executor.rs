//! Runs a single attempt of a task and reports the outcome.
//!
//! Output is streamed line by line into the task log as it is produced, so
//! `tail -f logs/task_<id>.log` shows live progress. The returned
//! [`TaskExecution`] carries a capped copy of the same output.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use cronkeeper_core::{ExecutionStatus, Task, TaskExecution};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    banner,
    command::CommandSpec,
    env,
    error::{ExecutorError, Result},
    process::{ProcessTable, StopRequest},
    truncate,
};

/// How long to keep draining pipes after the child exits. Grandchildren that
/// escaped the process group can hold them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Cap on the output kept in the execution record.
    pub max_output_chars: usize,
    /// Time between SIGTERM and SIGKILL in `stop_all_by_id`.
    pub stop_grace: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_output_chars: truncate::DEFAULT_MAX_CHARS,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Spawns task processes and tracks them until they exit.
///
/// Clones share the same process table.
#[derive(Clone, Default)]
pub struct TaskExecutor {
    processes: ProcessTable,
    options: ExecutorOptions,
}

/// How the wait loop ended.
enum Exit {
    Exited(ExitStatus),
    TimedOut(u64),
}

impl TaskExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            processes: ProcessTable::new(),
            options,
        }
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Number of live processes for `task_id`.
    pub fn running_count(&self, task_id: &str) -> usize {
        self.processes.running_count(task_id)
    }

    /// Ask every running process of `task_id` to stop (SIGTERM, then SIGKILL
    /// after the grace period). Returns immediately with the count signalled.
    pub fn stop_all_by_id(&self, task_id: &str) -> usize {
        self.processes
            .request_stop(Some(task_id), self.options.stop_grace)
    }

    /// Stop everything this executor is tracking (engine shutdown).
    pub fn stop_all(&self) -> usize {
        self.processes.request_stop(None, self.options.stop_grace)
    }

    /// Run one attempt of `task`. Never fails: problems are recorded in the
    /// returned execution and, when possible, in the task log.
    pub async fn execute(&self, task: &Task) -> TaskExecution {
        let mut execution = TaskExecution::start(&task.task_id);
        info!(
            task_id = %task.task_id,
            execution_id = %execution.execution_id,
            command = %task.task_exec,
            "starting task"
        );

        let log_path = PathBuf::from(&task.task_log);
        let mut log = match open_log(&log_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                error!(task_id = %task.task_id, "cannot open task log: {e}");
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(e.to_string());
                None
            }
        };

        if let Some(mut file) = log.take() {
            if let Err(e) = write_log(&mut file, &banner::start_banner(task, &execution)).await {
                warn!(task_id = %task.task_id, "failed to write start banner: {e}");
            }
            log = self.run_process(task, &mut execution, file).await;
        }

        execution.finish();
        execution.output =
            truncate::truncate_output(&execution.output, self.options.max_output_chars);

        if let Some(file) = log.as_mut() {
            if let Err(e) = write_log(file, &banner::end_banner(task, &execution)).await {
                error!(task_id = %task.task_id, "failed to write end banner: {e}");
            }
        }

        match execution.status {
            ExecutionStatus::Success => info!(
                task_id = %task.task_id,
                execution_id = %execution.execution_id,
                duration = execution.duration.unwrap_or_default(),
                "task succeeded"
            ),
            ExecutionStatus::Terminated => info!(
                task_id = %task.task_id,
                execution_id = %execution.execution_id,
                "task terminated"
            ),
            _ => error!(
                task_id = %task.task_id,
                execution_id = %execution.execution_id,
                return_code = ?execution.return_code,
                error = execution.error_message.as_deref().unwrap_or(""),
                "task failed"
            ),
        }
        execution
    }

    /// Spawn, stream, wait. Hands the log file back for the end banner.
    async fn run_process(
        &self,
        task: &Task,
        execution: &mut TaskExecution,
        mut log: File,
    ) -> Option<File> {
        let spec = CommandSpec::parse(&task.task_exec);
        let env = env::build_environment(task);
        debug!(task_id = %task.task_id, ?spec, "prepared command");

        let mut child = match spec.to_command(&env).spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = ExecutorError::Spawn(e.to_string());
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(err.to_string());
                let banner = banner::error_banner(task, execution, &err.to_string());
                let _ = write_log(&mut log, &banner).await;
                return Some(log);
            }
        };

        let pid = child.id();
        let mut stop_rx = self
            .processes
            .register(&execution.execution_id, &task.task_id, pid);

        let (line_tx, line_rx) = mpsc::channel::<String>(1024);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, line_tx.clone()));
        }
        drop(line_tx);
        let writer = tokio::spawn(write_lines(log, line_rx));

        // A timeout too large to represent is treated as no timeout.
        let deadline = task.task_timeout.and_then(|secs| {
            let at = Instant::now().checked_add(Duration::from_secs(secs))?;
            Some((secs, at))
        });
        let waited = wait_child(&mut child, pid, deadline, &mut stop_rx).await;
        let stop_requested = *stop_rx.borrow() != StopRequest::None;
        self.processes.unregister(&execution.execution_id);

        // Drain whatever is still buffered in the pipes.
        for reader in readers.iter_mut() {
            if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut *reader)
                .await
                .is_err()
            {
                debug!(task_id = %task.task_id, "output pipe still open after exit, abandoning");
                reader.abort();
            }
        }
        let (mut log, write_error) = match writer.await {
            Ok((log, output, write_error)) => {
                execution.output = output;
                (Some(log), write_error)
            }
            Err(e) => {
                error!(task_id = %task.task_id, "log writer task failed: {e}");
                (None, Some(std::io::Error::other(e.to_string())))
            }
        };

        match waited {
            Ok(Exit::Exited(status)) => classify_exit(execution, status, stop_requested),
            Ok(Exit::TimedOut(secs)) => {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(format!("task timed out after {secs}s"));
                warn!(task_id = %task.task_id, timeout_secs = secs, "task killed after timeout");
                if let Some(file) = log.as_mut() {
                    let _ = write_log(file, &banner::timeout_note(secs)).await;
                }
            }
            Err(e) => {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(e.to_string());
                if let Some(file) = log.as_mut() {
                    let _ = write_log(file, &banner::error_banner(task, execution, &e.to_string()))
                        .await;
                }
            }
        }

        if let Some(e) = write_error {
            error!(task_id = %task.task_id, "task log write failed: {e}");
            if execution.status == ExecutionStatus::Success {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(format!("log write failed: {e}"));
            }
        }

        log
    }
}

/// Wait for the child while honouring the timeout and stop requests.
async fn wait_child(
    child: &mut Child,
    pid: Option<u32>,
    deadline: Option<(u64, Instant)>,
    stop_rx: &mut watch::Receiver<StopRequest>,
) -> Result<Exit> {
    let mut stop_open = true;
    loop {
        tokio::select! {
            status = child.wait() => return Ok(Exit::Exited(status?)),
            _ = sleep_until(deadline.map(|(_, at)| at)) => {
                force_kill(child, pid);
                child.wait().await?;
                return Ok(Exit::TimedOut(deadline.map_or(0, |(secs, _)| secs)));
            }
            changed = stop_rx.changed(), if stop_open => {
                if changed.is_err() {
                    stop_open = false;
                    continue;
                }
                let request = *stop_rx.borrow_and_update();
                match request {
                    StopRequest::Graceful => terminate(child, pid),
                    StopRequest::Forced => force_kill(child, pid),
                    StopRequest::None => {}
                }
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn classify_exit(execution: &mut TaskExecution, status: ExitStatus, stop_requested: bool) {
    execution.return_code = status.code();

    if status.success() {
        execution.status = ExecutionStatus::Success;
        return;
    }
    if stop_requested || killed_by_sigterm(&status) {
        execution.status = ExecutionStatus::Terminated;
        execution.error_message = Some("terminated by stop request".to_string());
        return;
    }
    execution.status = ExecutionStatus::Failed;
    execution.error_message = Some(match status.code() {
        Some(code) => format!("exit code {code}"),
        None => format!("killed by signal ({status})"),
    });
}

#[cfg(unix)]
fn killed_by_sigterm(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGTERM)
}

#[cfg(not(unix))]
fn killed_by_sigterm(_status: &ExitStatus) -> bool {
    false
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) -> bool {
    let Some(pid) = pid else { return false };
    // SAFETY: `pid` leads a process group we created with `process_group(0)`
    // and have not reaped yet.
    unsafe { libc::killpg(pid as libc::pid_t, signal) == 0 }
}

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    if !signal_group(pid, libc::SIGTERM) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn force_kill(child: &mut Child, pid: Option<u32>) {
    if !signal_group(pid, libc::SIGKILL) {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

async fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ExecutorError::LogFile {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|source| ExecutorError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_log(file: &mut File, text: &str) -> std::io::Result<()> {
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

/// Forward each line of `stream` (lossily decoded) to `tx`.
fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("output pipe read error: {e}");
                    break;
                }
            }
        }
    })
}

/// Append every received line to the log, flushing each one, and collect
/// the output. Keeps going after a write error so the record stays complete.
async fn write_lines(
    mut log: File,
    mut rx: mpsc::Receiver<String>,
) -> (File, String, Option<std::io::Error>) {
    let mut lines: Vec<String> = Vec::new();
    let mut write_error = None;

    while let Some(line) = rx.recv().await {
        if write_error.is_none() {
            let mut text = line.clone();
            text.push('\n');
            if let Err(e) = write_log(&mut log, &text).await {
                write_error = Some(e);
            }
        }
        lines.push(line);
    }
    (log, lines.join("\n"), write_error)
}
