//! Plain-text banners framing each execution in the task log.

use cronkeeper_core::{Task, TaskExecution};

const RULE: &str = "========================================";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn start_banner(task: &Task, execution: &TaskExecution) -> String {
    format!(
        "{RULE}\n\
         Task started: {} ({})\n\
         Execution ID: {}\n\
         Start time: {}\n\
         Command: {}\n\
         {RULE}\n\n",
        task.task_name,
        task.task_id,
        execution.execution_id,
        execution.start_time.format(TIME_FORMAT),
        task.task_exec,
    )
}

pub fn end_banner(task: &Task, execution: &TaskExecution) -> String {
    let end = execution
        .end_time
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string());
    let code = execution
        .return_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());

    format!(
        "\n{RULE}\n\
         Task finished: {} ({})\n\
         End time: {}\n\
         Duration: {:.2} s\n\
         Status: {}\n\
         Return code: {}\n\
         {RULE}\n",
        task.task_name,
        task.task_id,
        end,
        execution.duration.unwrap_or_default(),
        execution.status.to_string().to_uppercase(),
        code,
    )
}

pub fn error_banner(task: &Task, execution: &TaskExecution, message: &str) -> String {
    format!(
        "\n{RULE}\n\
         Task error: {}\n\
         Time: {}\n\
         Error: {}\n\
         {RULE}\n",
        task.task_id,
        execution.start_time.format(TIME_FORMAT),
        message,
    )
}

pub fn timeout_note(timeout_secs: u64) -> String {
    format!("\nTask timed out (>{timeout_secs}s); process killed.\n")
}
