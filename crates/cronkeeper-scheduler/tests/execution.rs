#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{task, wait_until, Fixture};
use cronkeeper_core::ExecutionStatus;
use cronkeeper_executor::TaskExecutor;
use cronkeeper_scheduler::cron::{CronRuntime, JobFn, JobFuture};
use cronkeeper_scheduler::retry::run_with_retry;
use cronkeeper_scheduler::FixedInterval;
use tokio::sync::watch;

fn retrying(id: &str, exec: &str) -> cronkeeper_core::Task {
    let mut t = task(id, exec);
    t.task_retry = 2;
    t.task_retry_interval = 1;
    t
}

#[tokio::test]
async fn retryable_failure_runs_until_exhausted() {
    let fx = Fixture::new();
    let t = retrying("always2", "exit 2").with_default_log(&fx.logs_dir());
    let (_tx, rx) = watch::channel(false);

    let outcome = run_with_retry(&TaskExecutor::default(), &t, rx, |_| {}).await;

    assert_eq!(outcome.executions.len(), 3);
    assert!(outcome.exhausted);
    assert_eq!(outcome.final_status, ExecutionStatus::Failed);
    for pair in outcome.executions.windows(2) {
        let gap = pair[1].start_time - pair[0].start_time;
        assert!(gap >= chrono::Duration::milliseconds(1000), "gap {gap}");
    }
}

#[tokio::test]
async fn business_failure_is_not_retried() {
    let fx = Fixture::new();
    let t = retrying("biz", "exit 1").with_default_log(&fx.logs_dir());
    let (_tx, rx) = watch::channel(false);

    let outcome = run_with_retry(&TaskExecutor::default(), &t, rx, |_| {}).await;

    assert_eq!(outcome.executions.len(), 1);
    assert!(!outcome.exhausted);
    assert_eq!(outcome.executions[0].return_code, Some(1));
}

#[tokio::test]
async fn success_on_second_attempt_stops_retrying() {
    let fx = Fixture::new();
    let marker = fx.dir.path().join("attempted");
    let exec = format!(
        "if [ -f '{m}' ]; then echo recovered; exit 0; else touch '{m}'; exit 2; fi",
        m = marker.display()
    );
    let t = retrying("flaky", &exec).with_default_log(&fx.logs_dir());
    let (_tx, rx) = watch::channel(false);

    let outcome = run_with_retry(&TaskExecutor::default(), &t, rx, |_| {}).await;

    assert_eq!(outcome.executions.len(), 2);
    assert_eq!(outcome.final_status, ExecutionStatus::Success);
    assert!(!outcome.exhausted);
    assert!(outcome.executions[1].output.contains("recovered"));
}

#[tokio::test]
async fn timeout_kills_and_fails_once() {
    let fx = Fixture::new();
    let mut t = task("slow", "sleep 10");
    t.task_timeout = Some(1);
    fx.engine.add_task(t).await.unwrap();

    fx.engine.execute_manually("slow").unwrap();
    assert!(wait_until(Duration::from_secs(8), || !fx.engine.executions("slow").is_empty()).await);

    let history = fx.engine.executions("slow");
    assert_eq!(history.len(), 1);
    let run = &history[0];
    assert_eq!(run.status, ExecutionStatus::Failed);
    let secs = run.duration.unwrap();
    assert!((0.9..4.0).contains(&secs), "duration {secs}");
    assert_eq!(fx.engine.running_count("slow"), 0);
}

#[tokio::test]
async fn manual_run_records_history_and_log() {
    let fx = Fixture::new();
    fx.engine
        .add_task(task("hello", "echo \"hello from $TASK_ID\""))
        .await
        .unwrap();

    fx.engine.run_once("hello").unwrap();
    assert!(wait_until(Duration::from_secs(5), || !fx.engine.executions("hello").is_empty()).await);

    let run = &fx.engine.executions("hello")[0];
    assert_eq!(run.status, ExecutionStatus::Success);
    assert_eq!(run.output.trim(), "hello from hello");

    let log_path = fx.engine.get_task("hello").unwrap().task.task_log;
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("hello from hello"));
    assert!(log.contains("Status: SUCCESS"));

    assert!(fx.engine.execute_manually("nobody").is_err());
}

#[tokio::test]
async fn history_is_bounded() {
    let fx = Fixture::with(|c| c.scheduler.history_limit = 2);
    fx.engine.add_task(task("often", "true")).await.unwrap();

    let last_id = |fx: &Fixture| {
        let history = fx.engine.executions("often");
        history.last().map(|e| e.execution_id.clone())
    };
    let mut previous = None;
    for _ in 0..3 {
        fx.engine.execute_manually("often").unwrap();
        assert!(wait_until(Duration::from_secs(5), || last_id(&fx) != previous).await);
        previous = last_id(&fx);
    }
    assert_eq!(fx.engine.executions("often").len(), 2);
}

#[tokio::test]
async fn removing_a_task_stops_its_process() {
    let fx = Fixture::new();
    fx.engine.add_task(task("longrun", "sleep 30")).await.unwrap();
    fx.engine.execute_manually("longrun").unwrap();
    assert!(wait_until(Duration::from_secs(3), || fx.engine.running_count("longrun") == 1).await);

    fx.engine.remove_task("longrun").await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || fx.engine.running_count("longrun") == 0).await);
}

#[tokio::test]
async fn fast_trigger_never_runs_two_instances() {
    let fx = Fixture::new();
    let t = task("exclusive", "sleep 1").with_default_log(&fx.logs_dir());
    let executor = TaskExecutor::default();
    let fires = Arc::new(AtomicUsize::new(0));

    let job: JobFn = {
        let executor = executor.clone();
        let fires = Arc::clone(&fires);
        Arc::new(move |cancel: watch::Receiver<bool>| -> JobFuture {
            let executor = executor.clone();
            let task = t.clone();
            let fires = Arc::clone(&fires);
            Box::pin(async move {
                fires.fetch_add(1, Ordering::SeqCst);
                run_with_retry(&executor, &task, cancel, |_| {}).await;
            })
        })
    };

    let runtime = CronRuntime::new();
    runtime.register("exclusive", Arc::new(FixedInterval(Duration::from_millis(100))), job);

    let mut peak = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(3500);
    while tokio::time::Instant::now() < deadline {
        peak = peak.max(executor.running_count("exclusive"));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    runtime.shutdown(Duration::from_secs(3)).await;

    assert_eq!(peak, 1);
    assert!(fires.load(Ordering::SeqCst) >= 2);
}
