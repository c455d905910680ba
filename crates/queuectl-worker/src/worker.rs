use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use queuectl_core::config::WorkerConfig;
use queuectl_exec::{CommandExecutor, ExecError};
use queuectl_store::{FailureOutcome, Job, JobStore};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::Result;

/// Backoff bounds while retrying the store write that resolves a claimed job.
const SETTLE_RETRY_MIN: Duration = Duration::from_millis(50);
const SETTLE_RETRY_MAX: Duration = Duration::from_secs(2);

/// Knobs for a single worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between polls when nothing is eligible.
    pub poll_interval: Duration,
    /// Random extra sleep in `0..=poll_jitter`, so parallel workers spread out.
    pub poll_jitter: Duration,
    pub command_timeout: Duration,
    /// Reclaim `processing` jobs untouched for this long before each claim.
    pub lease: Option<Duration>,
    /// On shutdown, kill the running command and release its job instead of
    /// letting it finish.
    pub abort_on_shutdown: bool,
    /// Exit after resolving exactly one job.
    pub once: bool,
    /// Exit the first time no eligible job is found.
    pub exit_when_idle: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            poll_jitter: Duration::from_millis(cfg.poll_jitter_ms),
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
            lease: cfg.lease_secs.map(Duration::from_secs),
            abort_on_shutdown: cfg.abort_on_shutdown,
            once: false,
            exit_when_idle: false,
        }
    }
}

/// What one worker did before it exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Jobs handed back to `pending` because shutdown aborted them.
    pub released: u64,
    /// Stale `processing` jobs this worker reclaimed.
    pub reclaimed: u64,
}

impl WorkerReport {
    pub fn resolved(&self) -> u64 {
        self.completed + self.retried + self.dead_lettered
    }
}

impl AddAssign for WorkerReport {
    fn add_assign(&mut self, other: Self) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.released += other.released;
        self.reclaimed += other.reclaimed;
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// Nothing eligible.
    Idle,
    /// A job was claimed, executed and resolved.
    Resolved,
    /// A job was claimed but shutdown aborted it; it is pending again.
    Released,
}

/// One sequential claim → execute → resolve loop.
pub struct Worker {
    name: String,
    store: Arc<JobStore>,
    executor: Arc<dyn CommandExecutor>,
    options: WorkerOptions,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<JobStore>,
        executor: Arc<dyn CommandExecutor>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            executor,
            options,
            cancel,
        }
    }

    /// Main loop. Runs until the token is cancelled, a mode flag says stop,
    /// or the store reports corruption.
    ///
    /// Cancellation is checked at the top of every iteration and interrupts
    /// the idle sleep; a job already claimed is always resolved or released
    /// before returning.
    pub async fn run(self) -> Result<WorkerReport> {
        info!(worker = %self.name, "worker started");
        let mut report = WorkerReport::default();

        loop {
            if self.cancel.is_cancelled() {
                info!(worker = %self.name, "stop requested, worker exiting");
                break;
            }

            match self.tick(&mut report).await {
                Ok(Tick::Resolved) if self.options.once => {
                    debug!(worker = %self.name, "single-shot mode, exiting");
                    break;
                }
                Ok(Tick::Resolved) => {}
                Ok(Tick::Released) => break,
                Ok(Tick::Idle) if self.options.exit_when_idle => {
                    debug!(worker = %self.name, "queue drained, exiting");
                    break;
                }
                Ok(Tick::Idle) => self.idle_sleep().await,
                Err(e) if e.is_fatal() => {
                    error!(worker = %self.name, "fatal store error: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!(worker = %self.name, "store error, retrying next poll: {e}");
                    self.idle_sleep().await;
                }
            }
        }

        info!(
            worker = %self.name,
            completed = report.completed,
            retried = report.retried,
            dead = report.dead_lettered,
            released = report.released,
            "worker stopped"
        );
        Ok(report)
    }

    async fn tick(&self, report: &mut WorkerReport) -> Result<Tick> {
        if let Some(lease) = self.options.lease {
            let reclaimed = self.store_call(move |s| s.reclaim_expired(lease)).await?;
            report.reclaimed += reclaimed as u64;
        }

        let Some(job) = self.store_call(|s| s.claim_next()).await? else {
            return Ok(Tick::Idle);
        };
        let span = info_span!("job", worker = %self.name, job_id = %job.id);
        self.process(job, report).instrument(span).await
    }

    async fn process(&self, job: Job, report: &mut WorkerReport) -> Result<Tick> {
        info!(command = %job.command, attempt = job.attempts + 1, "processing job");

        let run = self.executor.run(&job.command, self.options.command_timeout);
        let outcome = if self.options.abort_on_shutdown {
            tokio::select! {
                res = run => Some(res),
                // Dropping `run` kills the child.
                _ = self.cancel.cancelled() => None,
            }
        } else {
            Some(run.await)
        };

        let id = job.id.clone();
        let message = match outcome {
            None => {
                warn!("shutdown aborted running command");
                self.settle(move |s| s.release(&id)).await?;
                report.released += 1;
                return Ok(Tick::Released);
            }
            Some(Ok(result)) if result.success() => {
                if self.settle(move |s| s.complete(&id)).await? {
                    info!("job completed");
                    report.completed += 1;
                } else {
                    warn!("job was no longer processing, completion ignored");
                }
                return Ok(Tick::Resolved);
            }
            Some(Ok(result)) => {
                info!(exit_code = result.exit_code, "command failed");
                result.diagnostic()
            }
            Some(Err(ExecError::Timeout { ms })) => {
                info!(timeout_ms = ms, "command timed out");
                "timeout".to_string()
            }
            Some(Err(e)) => {
                warn!("command could not run: {e}");
                e.to_string()
            }
        };

        match self.settle(move |s| s.resolve_failure(&id, &message)).await? {
            Some(FailureOutcome::Retried { .. }) => report.retried += 1,
            Some(FailureOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
            None => warn!("job was no longer processing, failure ignored"),
        }
        Ok(Tick::Resolved)
    }

    /// Run a synchronous store call on the blocking pool so SQLite lock waits
    /// never stall the runtime.
    async fn store_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&JobStore) -> queuectl_store::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Record the outcome of a claimed job, retrying transient store errors
    /// (lock contention, I/O) until it sticks. Only a fatal error gives up,
    /// so a claimed job never stays `processing` because of a busy database.
    /// Cancellation is not observed here.
    async fn settle<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&JobStore) -> queuectl_store::Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut delay = SETTLE_RETRY_MIN;
        loop {
            match self.store_call(f.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(retry_in_ms = delay.as_millis() as u64, "recording job outcome failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(SETTLE_RETRY_MAX);
                }
            }
        }
    }

    async fn idle_sleep(&self) {
        let pause = self.sleep_duration_with_jitter();
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.options.poll_jitter.is_zero() {
            return self.options.poll_interval;
        }
        let jitter_ms = u64::try_from(self.options.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.options.poll_interval + Duration::from_millis(extra)
    }
}
