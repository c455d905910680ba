use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "queue.db";
pub const DEFAULT_CONFIG_FILE: &str = "queuectl.toml";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_JITTER_MS: u64 = 500;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;
pub const DEFAULT_BACKOFF_BASE: u32 = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Env var that points at an explicit config file.
pub const CONFIG_ENV: &str = "QUEUECTL_CONFIG";

/// Top-level config (queuectl.toml + QUEUECTL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on SQLite's write lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker loops `worker start` spawns.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Idle sleep between polls when the queue has nothing eligible.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound of the random jitter added to every idle sleep.
    #[serde(default = "default_poll_jitter_ms")]
    pub poll_jitter_ms: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// When set, `processing` jobs untouched for this long are reclaimed.
    /// Keep it well above `command_timeout_secs`.
    #[serde(default)]
    pub lease_secs: Option<u64>,
    /// Kill the running command on shutdown and hand the job back to `pending`.
    /// When false the command runs to completion before the worker exits.
    #[serde(default)]
    pub abort_on_shutdown: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_jitter_ms: DEFAULT_POLL_JITTER_MS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            lease_secs: None,
            abort_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry `n` waits `backoff_base ^ n` seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u32,
    /// Optional ceiling on a single backoff delay. Unset means uncapped.
    #[serde(default)]
    pub max_backoff_secs: Option<u64>,
    /// `max_retries` applied when an enqueue payload omits it.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
            max_backoff_secs: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_count() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_poll_jitter_ms() -> u64 {
    DEFAULT_POLL_JITTER_MS
}
fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_backoff_base() -> u32 {
    DEFAULT_BACKOFF_BASE
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl QueueConfig {
    /// Load config from a TOML file with QUEUECTL_* env var overrides.
    ///
    /// The file is looked up in order:
    ///   1. Explicit path argument
    ///   2. `$QUEUECTL_CONFIG`
    ///   3. `./queuectl.toml`
    ///
    /// A missing file is not an error; defaults fill every unset key.
    /// Nested env keys use a double underscore:
    /// `QUEUECTL_WORKER__POLL_INTERVAL_MS=250`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        Self::figment(&path)
            .merge(Env::prefixed("QUEUECTL_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(QueueConfig::default())).merge(Toml::file(path))
    }

    /// Reject values the queue cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.retry.backoff_base < 1 {
            return Err(crate::error::CoreError::Config(
                "retry.backoff_base must be at least 1".into(),
            ));
        }
        if self.retry.default_max_retries < 1 {
            return Err(crate::error::CoreError::Config(
                "retry.default_max_retries must be at least 1".into(),
            ));
        }
        if self.worker.count < 1 {
            return Err(crate::error::CoreError::Config(
                "worker.count must be at least 1".into(),
            ));
        }
        if let Some(lease) = self.worker.lease_secs {
            if lease <= self.worker.command_timeout_secs {
                return Err(crate::error::CoreError::Config(format!(
                    "worker.lease_secs ({lease}) must exceed worker.command_timeout_secs ({})",
                    self.worker.command_timeout_secs
                )));
            }
        }
        Ok(())
    }
}
