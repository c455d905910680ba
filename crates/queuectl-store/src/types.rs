use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its `next_run_at` to arrive.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Command exited 0. Terminal.
    Completed,
    /// Never stored. As a list filter it selects pending jobs that have
    /// failed at least once and are waiting for their retry.
    Failed,
    /// Retry budget exhausted. Terminal; needs manual handling.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// Legal persisted transitions. `Failed` is a filter label and never
    /// participates.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Dead)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied primary key.
    pub id: String,
    /// Shell command run through `sh -c`.
    pub command: String,
    pub state: JobState,
    /// Failed executions so far.
    pub attempts: u32,
    /// The job is dead-lettered once `attempts` reaches this value.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// Bumped on every state change.
    pub updated_at: DateTime<Utc>,
    /// Earliest instant the job may be claimed while `pending`.
    pub next_run_at: DateTime<Utc>,
    /// Diagnostic from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl Job {
    /// Pending and due at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at <= now
    }
}

/// Per-state job counts reported by `queuectl status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
    /// Subset of `pending` with at least one failed attempt.
    pub failed: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }
}

/// What `JobStore::normalize_legacy` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    /// Rows whose legacy `queued` state became `pending`.
    pub states_rewritten: usize,
    /// Timestamp cells re-encoded into the canonical format.
    pub timestamps_rewritten: usize,
    /// Timestamp cells that could not be parsed and were left alone.
    pub timestamps_unparseable: usize,
}
