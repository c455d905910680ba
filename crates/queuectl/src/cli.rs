use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use queuectl_store::JobState;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("QUEUECTL_GIT_SHA"), ")");

/// queuectl - durable shell-command job queue backed by SQLite
#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version = VERSION)]
#[command(about = "Enqueue shell commands and run them with retrying workers", long_about = None)]
pub struct Cli {
    /// Config file (default: $QUEUECTL_CONFIG, then ./queuectl.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Database file, overriding database.path from config
    #[arg(long, global = true)]
    pub db: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue a job from JSON: {"id": "...", "command": "...", "max_retries": 3}
    ///
    /// The payload is read from --file, else the positional argument, else stdin.
    Enqueue {
        /// JSON job definition
        job_json: Option<String>,

        /// Path to a JSON file containing the job definition
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Print jobs as JSON, oldest first
    List {
        /// Only jobs in this state (`failed` = pending jobs awaiting a retry)
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },

    /// Print job counts per state
    Status,

    /// Run workers
    Worker {
        #[command(subcommand)]
        action: WorkerCommand,
    },

    /// Repair data written by older tooling
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Start workers in the foreground until Ctrl-C / SIGTERM
    Start {
        /// Number of parallel workers (default: worker.count from config)
        #[arg(short, long)]
        count: Option<usize>,

        /// Exit after resolving exactly one job
        #[arg(long)]
        once: bool,

        /// Exit as soon as no job is eligible
        #[arg(long)]
        exit_when_idle: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum MaintenanceCommand {
    /// Rewrite legacy `queued` states and non-canonical timestamps
    Normalize,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateArg {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl From<StateArg> for JobState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Pending => JobState::Pending,
            StateArg::Processing => JobState::Processing,
            StateArg::Completed => JobState::Completed,
            StateArg::Failed => JobState::Failed,
            StateArg::Dead => JobState::Dead,
        }
    }
}
