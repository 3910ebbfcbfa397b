use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use cronkeeper_core::{CronkeeperConfig, Task, TaskExecution, TaskPatch, TaskView};
use cronkeeper_executor::{ExecutorOptions, TaskExecutor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    cron::{CronRuntime, JobFn, JobFuture},
    error::{Result, SchedulerError, StoreError},
    retry::{self, RetryOutcome},
    schedule::{self, CronSchedule},
    store::TaskStore,
    watcher::{ApiWriteClock, WatchEvent, Watcher},
};

/// Extra time granted to cron loops on shutdown, on top of the stop grace.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

/// Result of [`SchedulerEngine::update_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The new definition equals the current one; nothing was touched.
    Unchanged,
    /// Another update for the same task landed inside the dedup window.
    Deduplicated,
}

/// What a reconcile pass changed, by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    /// Subset of `updated` whose cron job was rebuilt.
    pub rescheduled: Vec<String>,
    /// `(old_id, new_id)`
    pub renamed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.renamed.is_empty()
    }
}

/// Owns the task registry and keeps cron jobs, running processes and the
/// on-disk definitions consistent with it.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: CronkeeperConfig,
    store: TaskStore,
    executor: TaskExecutor,
    cron: CronRuntime,
    registry: RwLock<HashMap<String, Task>>,
    history: Mutex<HashMap<String, VecDeque<TaskExecution>>>,
    last_update: Mutex<HashMap<String, Instant>>,
    /// Serialises every read-modify-write of the registry.
    op_lock: tokio::sync::Mutex<()>,
    clock: ApiWriteClock,
    shutdown: watch::Sender<bool>,
    watcher: tokio::sync::Mutex<Option<RunningWatcher>>,
}

struct RunningWatcher {
    watcher: Watcher,
    dispatch: JoinHandle<()>,
}

impl SchedulerEngine {
    pub fn new(config: CronkeeperConfig) -> Self {
        let store = TaskStore::new(&config.scheduler.tasks_dir, &config.scheduler.logs_dir);
        let executor = TaskExecutor::new(ExecutorOptions {
            max_output_chars: config.executor.max_output_chars,
            stop_grace: config.scheduler.stop_grace(),
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                executor,
                cron: CronRuntime::new(),
                registry: RwLock::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                last_update: Mutex::new(HashMap::new()),
                op_lock: tokio::sync::Mutex::new(()),
                clock: ApiWriteClock::new(),
                shutdown,
                watcher: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CronkeeperConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    /// The clock stamped by every mutation; shared with the watcher.
    pub fn clock(&self) -> &ApiWriteClock {
        &self.inner.clock
    }

    // --- lifecycle ---------------------------------------------------------

    /// Load every task, schedule the enabled ones and start the configured
    /// watcher. Fails only when the tasks directory is missing.
    ///
    /// The watcher starts before the initial load; reloads it triggers in the
    /// meantime wait on the operation lock.
    pub async fn start(&self) -> Result<()> {
        let tasks_dir = self.inner.store.tasks_dir();
        if !tasks_dir.is_dir() {
            return Err(StoreError::RootMissing(tasks_dir.to_path_buf()).into());
        }

        let _op = self.inner.op_lock.lock().await;
        {
            let mut slot = self.inner.watcher.lock().await;
            if slot.is_none() {
                *slot = self.start_watcher()?;
            }
        }

        for task in self.inner.store.load_all()? {
            self.install(task);
        }
        info!(
            tasks = self.read_registry().len(),
            scheduled = self.inner.cron.job_ids().len(),
            "scheduler engine started"
        );
        Ok(())
    }

    fn start_watcher(&self) -> Result<Option<RunningWatcher>> {
        let section = &self.inner.config.watcher;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let Some(watcher) = Watcher::start(
            section.mode,
            self.inner.store.tasks_dir().to_path_buf(),
            section,
            self.inner.clock.clone(),
            tx,
        )?
        else {
            return Ok(None);
        };

        let engine = Arc::downgrade(&self.inner);
        let dispatch = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = engine.upgrade() else { break };
                let engine = SchedulerEngine { inner };
                match event {
                    WatchEvent::ConfigChanged(path) => {
                        if let Err(e) = engine.reload_task_file(&path).await {
                            warn!(path = %path.display(), "reload failed: {e}");
                        }
                    }
                    WatchEvent::BulkChange => {
                        if let Err(e) = engine.reconcile_all().await {
                            warn!("reconcile failed: {e}");
                        }
                    }
                }
            }
            debug!("watch dispatch loop finished");
        });
        Ok(Some(RunningWatcher { watcher, dispatch }))
    }

    /// Stop the watcher, cancel every cron job and ask all running processes
    /// to terminate.
    pub async fn stop(&self) {
        info!("scheduler engine stopping");
        let running = self.inner.watcher.lock().await.take();
        if let Some(running) = running {
            running.watcher.stop().await;
            let mut dispatch = running.dispatch;
            if tokio::time::timeout(Duration::from_secs(5), &mut dispatch)
                .await
                .is_err()
            {
                dispatch.abort();
            }
        }

        self.inner.shutdown.send_replace(true);
        let signalled = self.inner.executor.stop_all();
        if signalled > 0 {
            info!(count = signalled, "termination requested for running tasks");
        }
        let grace = self.inner.config.scheduler.stop_grace() + SHUTDOWN_SLACK;
        self.inner.cron.shutdown(grace).await;
        info!("scheduler engine stopped");
    }

    // --- mutations ---------------------------------------------------------

    pub async fn add_task(&self, task: Task) -> Result<()> {
        let task = self.prepare(task)?;
        let _op = self.inner.op_lock.lock().await;

        if self.read_registry().contains_key(&task.task_id) {
            return Err(SchedulerError::TaskExists { id: task.task_id });
        }

        self.inner.clock.mark();
        self.inner.store.save_one(&task)?;
        if task.task_enabled {
            self.schedule(&task)?;
        }
        info!(task_id = %task.task_id, enabled = task.task_enabled, "task added");
        self.write_registry().insert(task.task_id.clone(), task);
        Ok(())
    }

    pub async fn update_task(&self, task: Task) -> Result<UpdateOutcome> {
        let task = self.prepare(task)?;
        let _op = self.inner.op_lock.lock().await;
        let task_id = task.task_id.clone();

        let current = self
            .get_definition(&task_id)
            .ok_or_else(|| not_found(&task_id))?;
        if current == task {
            debug!(task_id = %task_id, "update is identical, skipping");
            return Ok(UpdateOutcome::Unchanged);
        }

        let window = self.inner.config.scheduler.update_dedup_window();
        {
            let last = self.lock_last_update();
            if last.get(&task_id).is_some_and(|at| at.elapsed() < window) {
                info!(task_id = %task_id, "duplicate update inside dedup window, ignoring");
                return Ok(UpdateOutcome::Deduplicated);
            }
        }

        self.inner.clock.mark();
        self.inner.store.save_one(&task)?;

        self.inner.cron.deregister(&task_id);
        self.inner.executor.stop_all_by_id(&task_id);
        if current.task_log != task.task_log {
            remove_log(&task_id, &current.task_log);
        }
        if task.task_enabled {
            if let Err(e) = self.schedule(&task) {
                error!(task_id = %task_id, "task not rescheduled: {e}");
            }
        }
        self.write_registry().insert(task_id.clone(), task);
        self.lock_last_update().insert(task_id.clone(), Instant::now());
        info!(task_id = %task_id, "task updated");
        Ok(UpdateOutcome::Applied)
    }

    /// Merge `patch` over the current definition and apply it as an update.
    pub async fn patch_task(&self, task_id: &str, patch: TaskPatch) -> Result<UpdateOutcome> {
        let current = self
            .get_definition(task_id)
            .ok_or_else(|| not_found(task_id))?;
        self.update_task(patch.apply(&current)).await
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        if !self.read_registry().contains_key(task_id) {
            return Err(not_found(task_id));
        }

        self.inner.clock.mark();
        self.inner.store.delete_all(task_id)?;

        self.inner.cron.deregister(task_id);
        self.inner.executor.stop_all_by_id(task_id);
        self.write_registry().remove(task_id);
        self.lock_last_update().remove(task_id);
        info!(task_id, "task removed");
        Ok(())
    }

    /// `Ok(false)` when the task is already in the requested state.
    pub async fn toggle_task(&self, task_id: &str, enabled: bool) -> Result<bool> {
        let _op = self.inner.op_lock.lock().await;
        let mut task = self
            .get_definition(task_id)
            .ok_or_else(|| not_found(task_id))?;
        if task.task_enabled == enabled {
            return Ok(false);
        }

        task.task_enabled = enabled;
        self.inner.clock.mark();
        self.inner.store.save_one(&task)?;
        if enabled {
            self.schedule(&task)?;
        } else {
            self.inner.cron.deregister(task_id);
        }
        self.write_registry().insert(task_id.to_string(), task);
        info!(task_id, enabled, "task toggled");
        Ok(true)
    }

    /// Run the task now on a background tokio task, with retries. Does not
    /// wait for the run and does not conflict with the cron job.
    pub fn execute_manually(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_definition(task_id)
            .ok_or_else(|| not_found(task_id))?;
        info!(task_id, "manual execution requested");

        let engine = self.clone();
        let cancel = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            engine.run_task(&task, cancel).await;
        });
        Ok(())
    }

    /// Same as [`execute_manually`](Self::execute_manually).
    pub fn run_once(&self, task_id: &str) -> Result<()> {
        self.execute_manually(task_id)
    }

    // --- reads -------------------------------------------------------------

    pub fn list_tasks(&self) -> Vec<TaskView> {
        let mut tasks: Vec<Task> = self.read_registry().values().cloned().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        tasks.into_iter().map(|t| self.view(t)).collect()
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskView> {
        self.get_definition(task_id).map(|t| self.view(t))
    }

    /// Most recent executions, oldest first.
    pub fn executions(&self, task_id: &str) -> Vec<TaskExecution> {
        self.lock_history()
            .get(task_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Processes currently running for `task_id`.
    pub fn running_count(&self, task_id: &str) -> usize {
        self.inner.executor.running_count(task_id)
    }

    /// Registration generation of the task's cron job, if scheduled.
    pub fn job_generation(&self, task_id: &str) -> Option<u64> {
        self.inner.cron.generation(task_id)
    }

    pub fn next_run_time(&self, task_id: &str) -> Option<DateTime<Local>> {
        self.inner.cron.next_run(task_id)
    }

    /// Parse `expression` and return its next fire time.
    pub fn validate_schedule(&self, expression: &str) -> Result<DateTime<Local>> {
        schedule::next_fire_time(expression)
    }

    // --- reconciliation ----------------------------------------------------

    /// Bring the registry in line with everything under `tasks_dir`.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let _op = self.inner.op_lock.lock().await;
        let disk_tasks = self.inner.store.load_all()?;

        let mut disk: HashMap<String, Task> = disk_tasks
            .into_iter()
            .map(|t| (t.task_id.clone(), t))
            .collect();
        let memory: HashMap<String, Task> = self.read_registry().clone();
        let mut report = ReconcileReport::default();

        let mut disk_only: Vec<String> = disk
            .keys()
            .filter(|id| !memory.contains_key(*id))
            .cloned()
            .collect();
        let mut memory_only: Vec<String> = memory
            .keys()
            .filter(|id| !disk.contains_key(*id))
            .cloned()
            .collect();
        disk_only.sort();
        memory_only.sort();

        // Same name and command under a new id: treat as a rename.
        let mut claimed: HashSet<String> = HashSet::new();
        let mut renamed_old: HashSet<String> = HashSet::new();
        for old_id in &memory_only {
            let old = &memory[old_id];
            let Some(new_id) = disk_only.iter().find(|id| {
                !claimed.contains(*id)
                    && disk[*id].task_name == old.task_name
                    && disk[*id].task_exec == old.task_exec
            }) else {
                continue;
            };
            claimed.insert(new_id.clone());
            renamed_old.insert(old_id.clone());
            report.renamed.push((old_id.clone(), new_id.clone()));
        }

        for (old_id, new_id) in &report.renamed {
            let old = &memory[old_id];
            let Some(new) = disk.remove(new_id) else { continue };
            info!(old_id = %old_id, new_id = %new_id, "task renamed on disk");
            self.drop_task(old_id);
            if old.task_log != new.task_log {
                remove_log(old_id, &old.task_log);
            }
            self.install(new);
        }

        for task_id in disk_only.iter().filter(|id| !claimed.contains(*id)) {
            if let Some(task) = disk.remove(task_id) {
                info!(task_id = %task_id, "task added on disk");
                self.install(task);
                report.added.push(task_id.clone());
            }
        }

        for task_id in memory_only.iter().filter(|id| !renamed_old.contains(*id)) {
            info!(task_id = %task_id, "task removed on disk");
            self.drop_task(task_id);
            report.removed.push(task_id.clone());
        }

        let mut common: Vec<String> = disk
            .keys()
            .filter(|id| memory.contains_key(*id))
            .cloned()
            .collect();
        common.sort();
        for task_id in common {
            let (Some(new), Some(old)) = (disk.remove(&task_id), memory.get(&task_id)) else {
                continue;
            };
            if &new == old {
                continue;
            }
            if self.replace(old, new) {
                report.rescheduled.push(task_id.clone());
            }
            report.updated.push(task_id);
        }

        if !report.is_empty() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                renamed = report.renamed.len(),
                "registry reconciled with disk"
            );
        }
        Ok(report)
    }

    /// React to one changed `config.json`.
    pub async fn reload_task_file(&self, path: &Path) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let Some(task_id) = self.inner.store.task_id_for_path(path) else {
            debug!(path = %path.display(), "not a task config, ignoring");
            return Ok(report);
        };

        let _op = self.inner.op_lock.lock().await;
        let loaded = match self.inner.store.load_one(&task_id) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(task_id = %task_id, "ignoring unreadable task config: {e}");
                return Ok(report);
            }
        };

        let current = self.get_definition(&task_id);
        match (current, loaded) {
            (None, Some(task)) => {
                info!(task_id = %task_id, "new task config found");
                self.install(task);
                report.added.push(task_id);
            }
            (Some(_), None) => {
                info!(task_id = %task_id, "task config gone");
                self.drop_task(&task_id);
                report.removed.push(task_id);
            }
            (Some(old), Some(new)) if old != new => {
                if self.replace(&old, new) {
                    report.rescheduled.push(task_id.clone());
                }
                info!(task_id = %task_id, "task config reloaded");
                report.updated.push(task_id);
            }
            _ => debug!(task_id = %task_id, "task config unchanged"),
        }
        Ok(report)
    }

    // --- private helpers ---------------------------------------------------

    /// Normalise and validate an incoming definition.
    fn prepare(&self, task: Task) -> Result<Task> {
        let task = task.with_default_log(self.inner.store.logs_dir());
        task.validate().map_err(SchedulerError::InvalidTask)?;
        CronSchedule::parse(&task.task_schedule)?;
        Ok(task)
    }

    /// Register a cron job that runs the latest definition of `task`.
    fn schedule(&self, task: &Task) -> Result<u64> {
        let schedule = CronSchedule::parse(&task.task_schedule)?;
        let generation = self
            .inner
            .cron
            .register(&task.task_id, Arc::new(schedule), self.job(&task.task_id));
        debug!(task_id = %task.task_id, generation, "cron job scheduled");
        Ok(generation)
    }

    fn job(&self, task_id: &str) -> JobFn {
        let engine: Weak<Inner> = Arc::downgrade(&self.inner);
        let task_id = task_id.to_string();
        Arc::new(move |cancel: watch::Receiver<bool>| -> JobFuture {
            let engine = engine.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                let Some(inner) = engine.upgrade() else { return };
                let engine = SchedulerEngine { inner };
                match engine.get_definition(&task_id) {
                    Some(task) if task.task_enabled => {
                        engine.run_task(&task, cancel).await;
                    }
                    _ => debug!(task_id = %task_id, "task gone or disabled, skipping fire"),
                }
            })
        })
    }

    async fn run_task(&self, task: &Task, cancel: watch::Receiver<bool>) -> RetryOutcome {
        let outcome = retry::run_with_retry(&self.inner.executor, task, cancel, |execution| {
            self.record(execution.clone());
        })
        .await;
        debug!(
            task_id = %task.task_id,
            attempts = outcome.executions.len(),
            status = %outcome.final_status,
            exhausted = outcome.exhausted,
            "task run finished"
        );
        outcome
    }

    fn record(&self, execution: TaskExecution) {
        let limit = self.inner.config.scheduler.history_limit.max(1);
        let mut history = self.lock_history();
        let entries = history.entry(execution.task_id.clone()).or_default();
        entries.push_back(execution);
        while entries.len() > limit {
            entries.pop_front();
        }
    }

    /// Add a task that came from disk. An invalid schedule leaves it
    /// registered but unscheduled.
    fn install(&self, task: Task) {
        if task.task_enabled {
            if let Err(e) = self.schedule(&task) {
                error!(task_id = %task.task_id, "task not scheduled: {e}");
            }
        }
        self.write_registry().insert(task.task_id.clone(), task);
    }

    /// Tear down a task that disappeared from disk.
    fn drop_task(&self, task_id: &str) {
        self.inner.cron.deregister(task_id);
        self.inner.executor.stop_all_by_id(task_id);
        self.write_registry().remove(task_id);
    }

    /// Swap in a changed definition. Returns true if the cron job was rebuilt.
    fn replace(&self, old: &Task, new: Task) -> bool {
        let task_id = new.task_id.clone();
        let critical = old.has_critical_changes(&new);
        if critical {
            self.inner.cron.deregister(&task_id);
            self.inner.executor.stop_all_by_id(&task_id);
            if new.task_enabled {
                if let Err(e) = self.schedule(&new) {
                    error!(task_id = %task_id, "task not rescheduled: {e}");
                }
            }
        }
        if old.task_log != new.task_log {
            remove_log(&task_id, &old.task_log);
        }
        self.write_registry().insert(task_id, new);
        critical
    }

    fn view(&self, task: Task) -> TaskView {
        let next_run_time = self.inner.cron.next_run(&task.task_id);
        TaskView {
            task,
            next_run_time,
        }
    }

    fn get_definition(&self, task_id: &str) -> Option<Task> {
        self.read_registry().get(task_id).cloned()
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Task>> {
        self.inner.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Task>> {
        self.inner.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<TaskExecution>>> {
        self.inner.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_update(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.inner.last_update.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(task_id: &str) -> SchedulerError {
    SchedulerError::TaskNotFound {
        id: task_id.to_string(),
    }
}

fn remove_log(task_id: &str, path: &str) {
    if path.is_empty() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!(task_id, path, "old log file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(task_id, path, "could not remove old log file: {e}"),
    }
}
