use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use queuectl_core::QueueConfig;
use queuectl_exec::ShellExecutor;
use queuectl_store::{JobState, JobStore};
use queuectl_worker::{WorkerOptions, WorkerPool};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cli;
mod payload;

use cli::{Cli, Command, MaintenanceCommand, WorkerCommand};

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str =
    "queuectl=info,queuectl_worker=info,queuectl_store=info,queuectl_exec=info";

#[tokio::main]
async fn main() {
    // stdout carries JSON output, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // load config: --config > QUEUECTL_CONFIG env > ./queuectl.toml
    let mut config = QueueConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    match cli.command {
        Command::Enqueue { job_json, file } => {
            let raw = payload::read_raw(file.as_deref(), job_json.as_deref())?;
            let job = payload::parse(&raw, config.retry.default_max_retries)?;
            let store = open_store(&config)?;
            store.enqueue(&job.id, &job.command, job.max_retries)?;
            println!("Enqueued job {}", job.id);
        }
        Command::List { state } => {
            let store = open_store(&config)?;
            print_json(&store.list(state.map(JobState::from))?)?;
        }
        Command::Status => {
            let store = open_store(&config)?;
            print_json(&store.stats()?)?;
        }
        Command::Worker {
            action:
                WorkerCommand::Start {
                    count,
                    once,
                    exit_when_idle,
                },
        } => {
            if let Some(count) = count {
                config.worker.count = count;
            }
            start_workers(&config, once, exit_when_idle).await?;
        }
        Command::Maintenance {
            action: MaintenanceCommand::Normalize,
        } => {
            let store = open_store(&config)?;
            let report = store.normalize_legacy()?;
            info!(
                states = report.states_rewritten,
                timestamps = report.timestamps_rewritten,
                unparseable = report.timestamps_unparseable,
                "normalization complete"
            );
            print_json(&report)?;
        }
    }
    Ok(())
}

async fn start_workers(config: &QueueConfig, once: bool, exit_when_idle: bool) -> anyhow::Result<()> {
    config.validate()?;
    ensure_parent_dir(&config.database.path);
    info!(path = %config.database.path, count = config.worker.count, "starting workers");

    let options = WorkerOptions {
        once,
        exit_when_idle,
        ..WorkerOptions::from(&config.worker)
    };
    let executor = Arc::new(ShellExecutor::new(config.worker.max_output_chars));
    let store_config = config.clone();
    let pool = WorkerPool::spawn(config.worker.count, options, executor, move || {
        JobStore::from_config(&store_config)
    })?;

    let cancel = pool.cancel_token();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let report = pool.join().await?;
    // stop the signal listener if the workers exited on their own
    cancel.cancel();

    info!(
        completed = report.completed,
        retried = report.retried,
        dead = report.dead_lettered,
        released = report.released,
        reclaimed = report.reclaimed,
        "all workers stopped"
    );
    Ok(())
}

/// Cancel `token` on Ctrl-C or (on unix) SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, finishing in-flight jobs"),
        _ = terminate => info!("received SIGTERM, finishing in-flight jobs"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

fn open_store(config: &QueueConfig) -> anyhow::Result<JobStore> {
    ensure_parent_dir(&config.database.path);
    JobStore::from_config(config)
        .with_context(|| format!("failed to open database {}", config.database.path))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
