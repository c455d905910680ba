use chrono::{DateTime, Duration, Utc};
use queuectl_core::config::{RetryConfig, DEFAULT_BACKOFF_BASE};
use serde::Serialize;

/// Upper bound on how far in the future a retry may be scheduled (~100 years).
///
/// Keeps `next_run_at` inside four-digit years so stored timestamps stay
/// lexicographically ordered.
const MAX_SCHEDULE_AHEAD_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// How a failed execution was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back to `pending`, claimable again at `next_run_at`.
    Retried {
        delay_secs: u64,
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the job is now `dead`.
    DeadLettered { attempts: u32 },
}

/// Exponential backoff: retry `n` waits `base ^ n` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: u32,
    /// Optional ceiling on a single delay. `None` reproduces the uncapped
    /// reference behaviour.
    pub max_delay_secs: Option<u64>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max_delay_secs: None,
        }
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            base: cfg.backoff_base,
            max_delay_secs: cfg.max_backoff_secs,
        }
    }
}

impl BackoffPolicy {
    /// Delay in seconds before retry number `attempt` (1-based).
    pub fn delay_secs(&self, attempt: u32) -> u64 {
        let raw = u64::from(self.base).saturating_pow(attempt);
        match self.max_delay_secs {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }

    /// Decide the fate of a job that just failed, given its attempt count
    /// *before* this failure.
    ///
    /// Dead-letters when `attempts + 1 >= max_retries`; otherwise schedules
    /// the retry `delay_secs(attempts + 1)` after `now`.
    pub fn resolve(&self, attempts: u32, max_retries: u32, now: DateTime<Utc>) -> FailureOutcome {
        let new_attempts = attempts.saturating_add(1);
        if new_attempts >= max_retries {
            return FailureOutcome::DeadLettered {
                attempts: new_attempts,
            };
        }
        let delay_secs = self.delay_secs(new_attempts);
        let ahead = delay_secs.min(MAX_SCHEDULE_AHEAD_SECS) as i64;
        FailureOutcome::Retried {
            delay_secs,
            attempts: new_attempts,
            next_run_at: now + Duration::seconds(ahead),
        }
    }
}
