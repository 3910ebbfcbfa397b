use anyhow::Context;
use clap::Parser;
use cronkeeper_core::CronkeeperConfig;
use cronkeeper_scheduler::{CronSchedule, SchedulerEngine, TaskStore, Trigger};
use tracing::info;

mod cli;

use cli::{Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cronkeeper=info,cronkeeper_scheduler=info,cronkeeper_executor=info".into()
            }),
        )
        .init();

    match Args::parse().command {
        Commands::Run { config } => run(load_config(config.as_deref())?).await,
        Commands::CheckCron { expression } => {
            let next = cronkeeper_scheduler::schedule::next_fire_time(&expression)?;
            println!("{}", next.format("%Y-%m-%d %H:%M:%S %:z"));
            Ok(())
        }
        Commands::List { config } => list(&load_config(config.as_deref())?),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<CronkeeperConfig> {
    CronkeeperConfig::load(path).context("loading configuration")
}

async fn run(config: CronkeeperConfig) -> anyhow::Result<()> {
    info!(
        tasks_dir = %config.scheduler.tasks_dir.display(),
        watcher = ?config.watcher.mode,
        "starting cronkeeper"
    );
    let engine = SchedulerEngine::new(config);
    engine.start().await?;
    info!(tasks = engine.list_tasks().len(), "scheduler running");

    shutdown_signal().await;
    info!("shutdown requested");
    engine.stop().await;
    Ok(())
}

fn list(config: &CronkeeperConfig) -> anyhow::Result<()> {
    let store = TaskStore::new(&config.scheduler.tasks_dir, &config.scheduler.logs_dir);
    let tasks = store.load_all()?;
    if tasks.is_empty() {
        println!("no tasks in {}", store.tasks_dir().display());
        return Ok(());
    }

    let now = chrono::Local::now();
    for task in tasks {
        let next = if !task.task_enabled {
            "disabled".to_string()
        } else {
            match CronSchedule::parse(&task.task_schedule) {
                Ok(schedule) => schedule
                    .next_after(&now)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string()),
                Err(e) => format!("invalid schedule: {e}"),
            }
        };
        println!(
            "{:<24} {:<16} {:<20} {}",
            task.task_id, task.task_schedule, next, task.task_name
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
