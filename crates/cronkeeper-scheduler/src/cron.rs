//! Cron trigger runtime: one tokio task per registered job.
//!
//! A job loop sleeps until the next fire time, runs the job to completion and
//! only then asks the trigger for the next fire time after *now*. A job can
//! therefore never overlap itself, and fire times missed while it was busy
//! collapse into a single run.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::schedule::Trigger;

/// Upper bound on missed fire times counted for the coalescing log line.
const MISSED_SCAN_LIMIT: usize = 1_000;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The work run at each fire time. The receiver flips to `true` (or closes)
/// when the job is deregistered or the runtime shuts down.
pub type JobFn = Arc<dyn Fn(watch::Receiver<bool>) -> JobFuture + Send + Sync>;

struct JobEntry {
    generation: u64,
    next_run: Arc<Mutex<Option<DateTime<Local>>>>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct CronRuntime {
    jobs: Mutex<HashMap<String, JobEntry>>,
    generation: AtomicU64,
}

impl CronRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a job loop for `job_id`, replacing any existing one. Returns the
    /// registration's generation number.
    pub fn register(&self, job_id: &str, trigger: Arc<dyn Trigger>, job: JobFn) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let next_run = Arc::new(Mutex::new(None));
        let (cancel, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(job_loop(
            job_id.to_string(),
            trigger,
            job,
            Arc::clone(&next_run),
            cancel_rx,
        ));

        let previous = self.lock().insert(
            job_id.to_string(),
            JobEntry {
                generation,
                next_run,
                cancel,
                handle,
            },
        );
        if let Some(old) = previous {
            let _ = old.cancel.send(true);
        }
        debug!(job_id, generation, "cron job registered");
        generation
    }

    /// Cancel the job loop. An execution already in progress is left to
    /// finish (or be stopped by its owner). Returns false if not registered.
    pub fn deregister(&self, job_id: &str) -> bool {
        match self.lock().remove(job_id) {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                debug!(job_id, generation = entry.generation, "cron job deregistered");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn generation(&self, job_id: &str) -> Option<u64> {
        self.lock().get(job_id).map(|e| e.generation)
    }

    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Local>> {
        let jobs = self.lock();
        let entry = jobs.get(job_id)?;
        let next = *entry
            .next_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        next
    }

    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every job and wait up to `timeout` for the loops to return;
    /// stragglers are aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        let entries: Vec<(String, JobEntry)> = self.lock().drain().collect();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "stopping cron jobs");

        let mut handles = Vec::with_capacity(entries.len());
        for (job_id, entry) in entries {
            let _ = entry.cancel.send(true);
            handles.push((job_id, entry.handle));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (job_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle)
                .await
                .is_err()
            {
                warn!(job_id = %job_id, "cron job did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CronRuntime {
    fn drop(&mut self) {
        let jobs = self.jobs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in jobs.drain() {
            entry.handle.abort();
        }
    }
}

/// True once the owner asked the loop to stop (or went away).
pub fn is_cancelled(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolves when `rx` flips to `true` or its sender is dropped.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn job_loop(
    job_id: String,
    trigger: Arc<dyn Trigger>,
    job: JobFn,
    next_run: Arc<Mutex<Option<DateTime<Local>>>>,
    mut cancel: watch::Receiver<bool>,
) {
    let set_next = |value: Option<DateTime<Local>>| {
        *next_run.lock().unwrap_or_else(PoisonError::into_inner) = value;
    };

    let mut from = Local::now();
    loop {
        let Some(fire_at) = trigger.next_after(&from) else {
            info!(job_id = %job_id, "schedule has no further fire times");
            set_next(None);
            return;
        };
        set_next(Some(fire_at));

        let wait = (fire_at - Local::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancelled(&mut cancel) => return,
        }
        if is_cancelled(&cancel) {
            return;
        }

        set_next(trigger.next_after(&fire_at));
        debug!(job_id = %job_id, fire_at = %fire_at, "cron job firing");
        // A panicking job must not take the loop down with it.
        if let Err(e) = tokio::spawn(job(cancel.clone())).await {
            if e.is_panic() {
                error!(job_id = %job_id, fire_at = %fire_at, "cron job panicked");
            }
        }

        if is_cancelled(&cancel) {
            return;
        }

        let now = Local::now();
        let missed = count_missed(trigger.as_ref(), fire_at, now);
        if missed > 0 {
            debug!(job_id = %job_id, missed, "fire times skipped while the job was running");
        }
        from = now;
    }
}

fn count_missed(trigger: &dyn Trigger, fired: DateTime<Local>, now: DateTime<Local>) -> usize {
    let mut count = 0;
    let mut cursor = fired;
    while count < MISSED_SCAN_LIMIT {
        match trigger.next_after(&cursor) {
            Some(t) if t <= now => {
                count += 1;
                cursor = t;
            }
            _ => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{CronSchedule, FixedInterval};
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: Arc<AtomicUsize>, busy: Duration) -> JobFn {
        Arc::new(move |_cancel: watch::Receiver<bool>| -> JobFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(busy).await;
            })
        })
    }

    #[tokio::test]
    async fn fires_repeatedly_and_stops_on_deregister() {
        let runtime = CronRuntime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        runtime.register(
            "tick",
            Arc::new(FixedInterval(Duration::from_millis(50))),
            counting_job(Arc::clone(&hits), Duration::ZERO),
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(runtime.deregister("tick"));
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} fires");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
        assert!(!runtime.deregister("tick"));
    }

    #[tokio::test]
    async fn slow_job_never_overlaps() {
        let runtime = CronRuntime::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let job: JobFn = {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            Arc::new(move |_cancel: watch::Receiver<bool>| -> JobFuture {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
        };
        runtime.register("slow", Arc::new(FixedInterval(Duration::from_millis(20))), job);

        tokio::time::sleep(Duration::from_millis(600)).await;
        runtime.shutdown(Duration::from_secs(1)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generations_increase_and_next_run_is_reported() {
        let runtime = CronRuntime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let daily = Arc::new(CronSchedule::parse("0 3 * * *").unwrap());

        let job = || counting_job(Arc::clone(&hits), Duration::ZERO);
        let g1 = runtime.register("nightly", daily.clone(), job());
        let g2 = runtime.register("nightly", daily, job());
        assert!(g2 > g1);
        assert_eq!(runtime.generation("nightly"), Some(g2));
        assert_eq!(runtime.job_ids(), vec!["nightly".to_string()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let next = runtime.next_run("nightly").unwrap();
        assert!(next > Local::now());
        assert_eq!(runtime.next_run("unknown"), None);
    }

    #[tokio::test]
    async fn shutdown_cancels_waiting_jobs() {
        let runtime = CronRuntime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        runtime.register(
            "later",
            Arc::new(FixedInterval(Duration::from_secs(3600))),
            counting_job(Arc::clone(&hits), Duration::ZERO),
        );
        tokio::time::timeout(Duration::from_secs(1), runtime.shutdown(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!runtime.is_registered("later"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_keeps_firing() {
        let runtime = CronRuntime::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let job: JobFn = {
            let hits = Arc::clone(&hits);
            Arc::new(move |_cancel: watch::Receiver<bool>| -> JobFuture {
                let hits = Arc::clone(&hits);
                Box::pin(async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run blows up");
                    }
                })
            })
        };
        let every_50ms = Arc::new(FixedInterval(Duration::from_millis(50)));
        runtime.register("fragile", every_50ms, job);

        tokio::time::sleep(Duration::from_millis(400)).await;
        runtime.shutdown(Duration::from_secs(1)).await;
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn missed_fire_times_are_counted() {
        let trigger = FixedInterval(Duration::from_secs(10));
        let fired = Local::now();
        assert_eq!(
            count_missed(&trigger, fired, fired + chrono::Duration::seconds(35)),
            3
        );
        assert_eq!(
            count_missed(&trigger, fired, fired + chrono::Duration::seconds(5)),
            0
        );
    }
}
