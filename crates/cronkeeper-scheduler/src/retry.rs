//! Exit-code driven retry loop around [`TaskExecutor::execute`].
//!
//! | Outcome                    | Decision        |
//! |----------------------------|-----------------|
//! | exit 0                     | stop (success)  |
//! | stopped / SIGTERM          | stop            |
//! | exit 1                     | stop (business) |
//! | anything else              | retry           |

use std::time::Duration;

use cronkeeper_core::{ExecutionStatus, Task, TaskExecution};
use cronkeeper_executor::TaskExecutor;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cron::cancelled;

/// Exit code a task uses to say "failed, do not retry".
pub const BUSINESS_FAILURE_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Success,
    Terminated,
    BusinessFailure,
    Retryable,
}

pub fn classify(execution: &TaskExecution) -> RetryDecision {
    match execution.status {
        ExecutionStatus::Success => RetryDecision::Success,
        ExecutionStatus::Terminated => RetryDecision::Terminated,
        _ if execution.return_code == Some(BUSINESS_FAILURE_CODE) => RetryDecision::BusinessFailure,
        _ => RetryDecision::Retryable,
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub executions: Vec<TaskExecution>,
    pub final_status: ExecutionStatus,
    /// Every attempt was used and the last one was still retryable.
    pub exhausted: bool,
}

/// Run `task` up to `task_retry + 1` times. `on_execution` sees each
/// execution as soon as it finishes. The wait between attempts ends early
/// when `cancel` fires, and no further attempt is made.
pub async fn run_with_retry<F>(
    executor: &TaskExecutor,
    task: &Task,
    mut cancel: watch::Receiver<bool>,
    mut on_execution: F,
) -> RetryOutcome
where
    F: FnMut(&TaskExecution),
{
    let max_attempts = task.task_retry.saturating_add(1);
    let interval = Duration::from_secs(task.task_retry_interval);
    let mut executions = Vec::new();
    let mut exhausted = false;

    for attempt in 0..max_attempts {
        let execution = executor.execute(task).await;
        on_execution(&execution);
        let decision = classify(&execution);
        executions.push(execution);

        match decision {
            RetryDecision::Success | RetryDecision::Terminated => break,
            RetryDecision::BusinessFailure => {
                info!(task_id = %task.task_id, "task reported a business failure, not retrying");
                break;
            }
            RetryDecision::Retryable if attempt + 1 < max_attempts => {
                warn!(
                    task_id = %task.task_id,
                    attempt = attempt + 1,
                    max_attempts,
                    retry_in_secs = task.task_retry_interval,
                    "task failed, will retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancelled(&mut cancel) => {
                        info!(task_id = %task.task_id, "retry cancelled");
                        break;
                    }
                }
            }
            RetryDecision::Retryable => {
                if task.task_retry > 0 {
                    warn!(task_id = %task.task_id, attempts = max_attempts, "retries exhausted");
                }
                exhausted = true;
            }
        }
    }

    let final_status = executions
        .last()
        .map(|e| e.status)
        .unwrap_or(ExecutionStatus::Failed);
    RetryOutcome {
        executions,
        final_status,
        exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(status: ExecutionStatus, code: Option<i32>) -> TaskExecution {
        let mut e = TaskExecution::start("t");
        e.status = status;
        e.return_code = code;
        e.finish();
        e
    }

    #[test]
    fn classification_matrix() {
        use ExecutionStatus::*;
        assert_eq!(
            classify(&finished(Success, Some(0))),
            RetryDecision::Success
        );
        assert_eq!(
            classify(&finished(Terminated, None)),
            RetryDecision::Terminated
        );
        assert_eq!(
            classify(&finished(Terminated, Some(1))),
            RetryDecision::Terminated
        );
        assert_eq!(
            classify(&finished(Failed, Some(1))),
            RetryDecision::BusinessFailure
        );
        assert_eq!(
            classify(&finished(Failed, Some(2))),
            RetryDecision::Retryable
        );
        assert_eq!(
            classify(&finished(Failed, Some(127))),
            RetryDecision::Retryable
        );
        // Timeout or spawn failure: no exit code.
        assert_eq!(classify(&finished(Failed, None)), RetryDecision::Retryable);
    }
}
