use std::sync::Arc;

use queuectl_exec::CommandExecutor;
use queuectl_store::JobStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    error::Result,
    worker::{Worker, WorkerOptions, WorkerReport},
};

/// N independent workers under one shutdown token.
///
/// Every worker gets its own `JobStore` from `open_store`, so in production
/// each holds its own SQLite connection and contends on the database lock
/// like separate processes would.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<Result<WorkerReport>>)>,
}

impl WorkerPool {
    /// Spawn `count` workers on the current Tokio runtime.
    pub fn spawn<F>(
        count: usize,
        options: WorkerOptions,
        executor: Arc<dyn CommandExecutor>,
        open_store: F,
    ) -> Result<Self>
    where
        F: Fn() -> queuectl_store::Result<JobStore>,
    {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(count);
        for i in 1..=count {
            let name = format!("worker-{i}");
            let worker = Worker::new(
                name.clone(),
                Arc::new(open_store()?),
                Arc::clone(&executor),
                options.clone(),
                cancel.child_token(),
            );
            handles.push((name, tokio::spawn(worker.run())));
        }
        info!(count, "worker pool started");
        Ok(Self { cancel, handles })
    }

    /// Token that stops every worker when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for all workers to exit and sum their reports.
    ///
    /// Returns the first worker error, after every worker has been joined.
    pub async fn join(self) -> Result<WorkerReport> {
        let mut total = WorkerReport::default();
        let mut first_err = None;
        for (name, handle) in self.handles {
            match handle.await {
                Ok(Ok(report)) => total += report,
                Ok(Err(e)) => {
                    error!(worker = %name, "worker failed: {e}");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    error!(worker = %name, "worker task panicked: {e}");
                    first_err.get_or_insert(e.into());
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Cancel every worker, then wait for them to finish their current job.
    pub async fn shutdown(self) -> Result<WorkerReport> {
        self.cancel.cancel();
        self.join().await
    }
}
