use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cronkeeper", version, about = "Cron scheduler for on-disk task definitions")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler and run until Ctrl-C or SIGTERM.
    Run {
        /// Config file; defaults to $CRONKEEPER_CONFIG, then ./cronkeeper.toml.
        #[arg(long)]
        config: Option<String>,
    },
    /// Validate a 5-field cron expression and print its next fire time.
    CheckCron { expression: String },
    /// Print every task in the tasks directory with its next run.
    List {
        #[arg(long)]
        config: Option<String>,
    },
}
