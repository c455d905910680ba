use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use queuectl_core::QueueConfig;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{
    backoff::{BackoffPolicy, FailureOutcome},
    db::{format_ts, init_db, parse_ts, JOB_COLUMNS},
    error::{Result, StoreError},
    types::{Job, JobState, NormalizeReport, StateCounts},
};

/// Longest diagnostic kept in `last_error`.
const MAX_ERROR_CHARS: usize = 2_000;

/// Durable job table with one atomic primitive: [`JobStore::claim_next`].
///
/// Each worker should own its own `JobStore` (and therefore its own SQLite
/// connection). Exclusivity between workers comes from SQLite's write lock,
/// taken up front by `BEGIN IMMEDIATE`, not from the in-process mutex.
pub struct JobStore {
    conn: Mutex<Connection>,
    backoff: BackoffPolicy,
}

impl JobStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    ///
    /// Databases written by older tooling are normalized on the spot, so the
    /// text comparisons behind claim order and eligibility hold.
    pub fn new(conn: Connection, backoff: BackoffPolicy) -> Result<Self> {
        init_db(&conn)?;
        let legacy = has_legacy_rows(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
            backoff,
        };
        if legacy {
            info!("legacy rows found, normalizing");
            store.normalize_legacy()?;
        }
        Ok(store)
    }

    /// Open (or create) the database file at `path`.
    ///
    /// Enables WAL so readers never block the claimer, and sets a busy
    /// timeout so contending writers wait instead of failing immediately.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration, backoff: BackoffPolicy) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn, backoff)
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        Self::open(
            &config.database.path,
            Duration::from_millis(config.database.busy_timeout_ms),
            BackoffPolicy::from(&config.retry),
        )
    }

    /// Insert a new `pending` job due immediately.
    ///
    /// Fails with `DuplicateId` when `id` is taken; the existing row is left
    /// untouched because the insert is a single statement.
    pub fn enqueue(&self, id: &str, command: &str, max_retries: u32) -> Result<Job> {
        self.enqueue_at(id, command, max_retries, Utc::now())
    }

    /// Atomically take the oldest eligible job and mark it `processing`.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        self.claim_next_at(Utc::now())
    }

    /// `processing -> completed`. Returns `false` (and changes nothing) when
    /// the job is missing or not currently processing.
    pub fn complete(&self, id: &str) -> Result<bool> {
        self.complete_at(id, Utc::now())
    }

    /// Record a failed execution: retry with backoff or dead-letter.
    ///
    /// Returns `None` when the job is missing or not processing; callers
    /// should treat that as benign.
    pub fn resolve_failure(&self, id: &str, error: &str) -> Result<Option<FailureOutcome>> {
        self.resolve_failure_at(id, error, Utc::now())
    }

    /// `processing -> pending` without consuming an attempt. Used when a
    /// worker aborts a running command during shutdown.
    pub fn release(&self, id: &str) -> Result<bool> {
        self.release_at(id, Utc::now())
    }

    /// Route every job stuck in `processing` longer than `lease` through the
    /// failure path. Returns the number of jobs reclaimed.
    pub fn reclaim_expired(&self, lease: Duration) -> Result<usize> {
        self.reclaim_expired_at(lease, Utc::now())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_raw,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Jobs in creation order, optionally filtered.
    ///
    /// `Some(JobState::Failed)` selects pending jobs with at least one failed
    /// attempt; every other filter is an exact state match.
    pub fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let (clause, arg) = match filter {
            None => ("", None),
            Some(JobState::Failed) => ("WHERE state = 'pending' AND attempts > 0", None),
            Some(state) => ("WHERE state = ?1", Some(state.as_str())),
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs {clause} ORDER BY created_at, rowid"
        ))?;
        let rows = match arg {
            Some(state) => stmt.query_map([state], row_to_raw)?,
            None => stmt.query_map([], row_to_raw)?,
        };
        let jobs = rows
            .map(|r| r.map_err(StoreError::from).and_then(RawJob::into_job))
            .collect::<Result<Vec<_>>>();
        jobs
    }

    pub fn stats(&self) -> Result<StateCounts> {
        let conn = self.conn();
        let mut counts = StateCounts::default();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?;
        for row in rows {
            let (state, n) = row?;
            match state.parse::<JobState>() {
                Ok(JobState::Pending) => counts.pending = n,
                Ok(JobState::Processing) => counts.processing = n,
                Ok(JobState::Completed) => counts.completed = n,
                Ok(JobState::Dead) => counts.dead = n,
                _ => warn!(%state, count = n, "unexpected state in jobs table"),
            }
        }
        counts.failed = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = 'pending' AND attempts > 0",
            [],
            |row| row.get(0),
        )?;
        Ok(counts)
    }

    /// Repair rows written by older tooling: the legacy `queued` state
    /// becomes `pending`, and timestamps in any parseable format are
    /// re-encoded canonically. Runs in one transaction.
    pub fn normalize_legacy(&self) -> Result<NormalizeReport> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut report = NormalizeReport {
            states_rewritten: tx.execute("UPDATE jobs SET state = 'pending' WHERE state = 'queued'", [])?,
            ..NormalizeReport::default()
        };

        let rows: Vec<(String, [String; 3])> = {
            let mut stmt = tx.prepare("SELECT id, created_at, updated_at, next_run_at FROM jobs")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, [row.get(1)?, row.get(2)?, row.get(3)?])))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (id, stamps) in rows {
            let mut fixed = stamps.clone();
            for cell in fixed.iter_mut() {
                match parse_ts(cell).map(format_ts) {
                    Some(canonical) if canonical != *cell => {
                        *cell = canonical;
                        report.timestamps_rewritten += 1;
                    }
                    Some(_) => {}
                    None => {
                        warn!(job_id = %id, value = %cell, "unparseable timestamp left as-is");
                        report.timestamps_unparseable += 1;
                    }
                }
            }
            if fixed != stamps {
                tx.execute(
                    "UPDATE jobs SET created_at = ?1, updated_at = ?2, next_run_at = ?3 WHERE id = ?4",
                    params![fixed[0], fixed[1], fixed[2], id],
                )?;
            }
        }
        tx.commit()?;
        info!(
            states = report.states_rewritten,
            timestamps = report.timestamps_rewritten,
            unparseable = report.timestamps_unparseable,
            "legacy rows normalized"
        );
        Ok(report)
    }

    // --- clock-explicit variants -------------------------------------------

    pub(crate) fn enqueue_at(
        &self,
        id: &str,
        command: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        validate_new_job(id, command, max_retries)?;
        let now_str = format_ts(now);
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO jobs
             (id, command, state, attempts, max_retries,
              created_at, updated_at, next_run_at, last_error)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4, NULL)",
            params![id, command, max_retries, now_str],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateId { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %id, max_retries, "job enqueued");

        // Round-trip through the stored text so the snapshot matches `get`.
        let now = parse_ts(&now_str).unwrap_or(now);
        Ok(Job {
            id: id.to_string(),
            command: command.to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_run_at: now,
            last_error: None,
        })
    }

    pub(crate) fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let now_str = format_ts(now);
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock before the SELECT, so no other
        // claimer can read the same row as pending in between.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // The text filter is a superset of the due rows (legacy
        // `YYYY-MM-DD HH:MM:SS` sorts before any same-day canonical stamp);
        // the decoded job makes the final call.
        let found = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE state = 'pending' AND next_run_at <= ?1
                 ORDER BY created_at, rowid"
            ))?;
            let mut rows = stmt.query([&now_str])?;
            let mut found = None;
            while let Some(row) = rows.next()? {
                let job = row_to_raw(row)?.into_job()?;
                if job.is_eligible(now) && job.state.can_transition_to(JobState::Processing) {
                    found = Some(job);
                    break;
                }
            }
            found
        };

        let Some(mut job) = found else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'processing', updated_at = ?1
             WHERE id = ?2 AND state = 'pending'",
            params![now_str, job.id],
        )?;
        tx.commit()?;

        job.state = JobState::Processing;
        job.updated_at = parse_ts(&now_str).unwrap_or(now);
        debug!(job_id = %job.id, attempts = job.attempts, "job claimed");
        Ok(Some(job))
    }

    pub(crate) fn complete_at(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(current) = current_state(&tx, id)? else {
            debug!(job_id = %id, "complete ignored: job missing");
            return Ok(false);
        };
        if !current.state.can_transition_to(JobState::Completed) {
            debug!(job_id = %id, state = %current.state, "complete ignored: job not processing");
            return Ok(false);
        }
        tx.execute(
            "UPDATE jobs SET state = 'completed', updated_at = ?1 WHERE id = ?2",
            params![format_ts(now), id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub(crate) fn resolve_failure_at(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(current) = current_state(&tx, id)? else {
            debug!(job_id = %id, "failure ignored: job missing");
            return Ok(None);
        };
        let outcome = self.apply_failure(&tx, id, current, error, now)?;
        if outcome.is_some() {
            tx.commit()?;
        }
        Ok(outcome)
    }

    pub(crate) fn release_at(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_str = format_ts(now);
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let released = match current_state(&tx, id)? {
            Some(current) if current.state.can_transition_to(JobState::Pending) => {
                tx.execute(
                    "UPDATE jobs SET state = 'pending', next_run_at = ?1, updated_at = ?1
                     WHERE id = ?2",
                    params![now_str, id],
                )?;
                tx.commit()?;
                true
            }
            _ => false,
        };
        if released {
            info!(job_id = %id, "job released back to pending");
        } else {
            debug!(job_id = %id, "release ignored: job missing or not processing");
        }
        Ok(released)
    }

    pub(crate) fn reclaim_expired_at(&self, lease: Duration, now: DateTime<Utc>) -> Result<usize> {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = match now.checked_sub_signed(lease) {
            Some(cutoff) => format_ts(cutoff),
            None => return Ok(0),
        };

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<(String, u32, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attempts, max_retries FROM jobs
                 WHERE state = 'processing' AND updated_at <= ?1
                 ORDER BY updated_at",
            )?;
            let rows = stmt
                .query_map([&cutoff], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut reclaimed = 0;
        for (id, attempts, max_retries) in stale {
            warn!(job_id = %id, "processing lease expired, reclaiming");
            let current = CurrentState {
                state: JobState::Processing,
                attempts,
                max_retries,
            };
            if self.apply_failure(&tx, &id, current, "lease expired", now)?.is_some() {
                reclaimed += 1;
            }
        }
        tx.commit()?;
        Ok(reclaimed)
    }

    // --- private helpers ---------------------------------------------------

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave SQLite half-written:
        // open transactions roll back when dropped.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared tail of `resolve_failure` and `reclaim_expired`; must run inside
    /// the caller's immediate transaction. Returns `None`, writing nothing,
    /// when `current.state` cannot take the resulting transition.
    fn apply_failure(
        &self,
        tx: &Transaction<'_>,
        id: &str,
        current: CurrentState,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>> {
        let outcome = self.backoff.resolve(current.attempts, current.max_retries, now);
        let next = match outcome {
            FailureOutcome::Retried { .. } => JobState::Pending,
            FailureOutcome::DeadLettered { .. } => JobState::Dead,
        };
        if !current.state.can_transition_to(next) {
            debug!(job_id = %id, state = %current.state, "failure ignored: job not processing");
            return Ok(None);
        }

        let now_str = format_ts(now);
        let error = clip(error, MAX_ERROR_CHARS);
        match &outcome {
            FailureOutcome::DeadLettered { attempts } => {
                tx.execute(
                    "UPDATE jobs SET state = 'dead', attempts = ?1, updated_at = ?2, last_error = ?3
                     WHERE id = ?4",
                    params![attempts, now_str, error, id],
                )?;
                warn!(job_id = %id, attempts, "job dead-lettered");
            }
            FailureOutcome::Retried {
                delay_secs,
                attempts,
                next_run_at,
            } => {
                tx.execute(
                    "UPDATE jobs SET state = 'pending', attempts = ?1, updated_at = ?2,
                      next_run_at = ?3, last_error = ?4
                     WHERE id = ?5",
                    params![attempts, now_str, format_ts(*next_run_at), error, id],
                )?;
                info!(job_id = %id, attempt = attempts, delay_secs, "job retry scheduled");
            }
        }
        Ok(Some(outcome))
    }
}

/// Decoded state and retry counters of one row.
#[derive(Debug, Clone, Copy)]
struct CurrentState {
    state: JobState,
    attempts: u32,
    max_retries: u32,
}

fn current_state(conn: &Connection, id: &str) -> Result<Option<CurrentState>> {
    let row: Option<(String, u32, u32)> = conn
        .query_row(
            "SELECT state, attempts, max_retries FROM jobs WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((state, attempts, max_retries)) = row else {
        return Ok(None);
    };
    let state = state.parse::<JobState>().map_err(|reason| StoreError::Corrupt {
        id: id.to_string(),
        reason,
    })?;
    Ok(Some(CurrentState {
        state,
        attempts,
        max_retries,
    }))
}

/// True when any row still carries the legacy `queued` state or a timestamp
/// not in the canonical `YYYY-MM-DDTHH:MM:SS.ffffffZ` shape.
fn has_legacy_rows(conn: &Connection) -> Result<bool> {
    let odd = |col: &str| {
        format!("(length({col}) != 27 OR substr({col}, 11, 1) != 'T' OR substr({col}, 27, 1) != 'Z')")
    };
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM jobs WHERE state = 'queued' OR {} OR {} OR {})",
        odd("created_at"),
        odd("updated_at"),
        odd("next_run_at"),
    );
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

fn validate_new_job(id: &str, command: &str, max_retries: u32) -> Result<()> {
    if id.trim().is_empty() {
        return Err(StoreError::Validation("id must not be empty".into()));
    }
    if command.trim().is_empty() {
        return Err(StoreError::Validation("command must not be empty".into()));
    }
    if max_retries < 1 {
        return Err(StoreError::Validation("max_retries must be at least 1".into()));
    }
    Ok(())
}

fn clip(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s.to_string(),
    }
}

/// Row as stored, before state and timestamps are decoded.
struct RawJob {
    id: String,
    command: String,
    state: String,
    attempts: u32,
    max_retries: u32,
    created_at: String,
    updated_at: String,
    next_run_at: String,
    last_error: Option<String>,
}

/// Map a SELECT row (column order from `JOB_COLUMNS`).
fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        command: row.get(1)?,
        state: row.get(2)?,
        attempts: row.get(3)?,
        max_retries: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        next_run_at: row.get(7)?,
        last_error: row.get(8)?,
    })
}

impl RawJob {
    fn into_job(self) -> Result<Job> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let state = self.state.parse::<JobState>().map_err(corrupt)?;
        if state == JobState::Failed {
            return Err(corrupt("'failed' is not a storable state".into()));
        }
        let ts = |field: &str, raw: &str| {
            parse_ts(raw).ok_or_else(|| corrupt(format!("bad {field} timestamp: {raw}")))
        };
        Ok(Job {
            created_at: ts("created_at", &self.created_at)?,
            updated_at: ts("updated_at", &self.updated_at)?,
            next_run_at: ts("next_run_at", &self.next_run_at)?,
            state,
            attempts: self.attempts,
            max_retries: self.max_retries,
            last_error: self.last_error,
            command: self.command,
            id: self.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    fn memory_store() -> JobStore {
        JobStore::new(Connection::open_in_memory().unwrap(), BackoffPolicy::default()).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn enqueue_sets_initial_fields() {
        let store = memory_store();
        let job = store.enqueue("j1", "echo hi", 3).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, job.next_run_at);

        let stored = store.get("j1").unwrap().unwrap();
        assert_eq!(stored.command, "echo hi");
        assert_eq!(stored.created_at, job.created_at);
        assert!(stored.last_error.is_none());
    }

    #[test]
    fn duplicate_id_leaves_first_job_untouched() {
        let store = memory_store();
        store.enqueue("dup", "exit 1", 3).unwrap();
        let claimed = store.claim_next().unwrap().unwrap();
        store.resolve_failure(&claimed.id, "boom").unwrap();

        let err = store.enqueue("dup", "echo other", 5).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { ref id } if id == "dup"));

        let jobs = store.list(None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].command, "exit 1");
        assert_eq!(jobs[0].attempts, 1);
        assert_eq!(jobs[0].max_retries, 3);
        assert_eq!(jobs[0].state, JobState::Pending);
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let store = memory_store();
        assert!(matches!(store.enqueue("", "true", 1), Err(StoreError::Validation(_))));
        assert!(matches!(store.enqueue("a", "  ", 1), Err(StoreError::Validation(_))));
        assert!(matches!(store.enqueue("a", "true", 0), Err(StoreError::Validation(_))));
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn claim_returns_none_on_empty_queue() {
        assert!(memory_store().claim_next().unwrap().is_none());
    }

    #[test]
    fn claim_is_fifo_by_creation() {
        let store = memory_store();
        let t0 = Utc::now() - secs(10);
        store.enqueue_at("b", "true", 1, t0 + secs(2)).unwrap();
        store.enqueue_at("a", "true", 1, t0).unwrap();
        store.enqueue_at("c", "true", 1, t0 + secs(4)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| store.claim_next().unwrap())
            .map(|j| j.id)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn identical_timestamps_fall_back_to_insertion_order() {
        let store = memory_store();
        let t = Utc::now() - secs(1);
        store.enqueue_at("first", "true", 1, t).unwrap();
        store.enqueue_at("second", "true", 1, t).unwrap();
        assert_eq!(store.claim_next().unwrap().unwrap().id, "first");
    }

    #[test]
    fn claim_marks_processing_and_skips_claimed() {
        let store = memory_store();
        store.enqueue("only", "true", 1).unwrap();
        let job = store.claim_next().unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(store.get("only").unwrap().unwrap().state, JobState::Processing);
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn future_jobs_are_not_eligible() {
        let store = memory_store();
        let now = Utc::now();
        store.enqueue_at("later", "true", 1, now + secs(60)).unwrap();
        assert!(store.claim_next_at(now).unwrap().is_none());
        assert!(store.claim_next_at(now + secs(61)).unwrap().is_some());
    }

    #[test]
    fn retry_arithmetic_with_three_retries() {
        let store = memory_store();
        let t0 = Utc::now();
        store.enqueue_at("r", "exit 1", 3, t0).unwrap();

        store.claim_next_at(t0).unwrap().unwrap();
        let first = store.resolve_failure_at("r", "exit=1", t0).unwrap().unwrap();
        assert!(matches!(first, FailureOutcome::Retried { delay_secs: 3, attempts: 1, .. }));
        let job = store.get("r").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.next_run_at, parse_ts(&format_ts(t0 + secs(3))).unwrap());
        assert_eq!(job.last_error.as_deref(), Some("exit=1"));

        // Not eligible until the backoff elapses.
        assert!(store.claim_next_at(t0 + secs(2)).unwrap().is_none());
        let t1 = t0 + secs(3);
        store.claim_next_at(t1).unwrap().unwrap();
        let second = store.resolve_failure_at("r", "exit=1", t1).unwrap().unwrap();
        assert!(matches!(second, FailureOutcome::Retried { delay_secs: 9, attempts: 2, .. }));
        assert_eq!(
            store.get("r").unwrap().unwrap().next_run_at,
            parse_ts(&format_ts(t1 + secs(9))).unwrap()
        );

        let t2 = t1 + secs(9);
        store.claim_next_at(t2).unwrap().unwrap();
        let third = store.resolve_failure_at("r", "exit=1", t2).unwrap().unwrap();
        assert_eq!(third, FailureOutcome::DeadLettered { attempts: 3 });

        let job = store.get("r").unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
        assert!(store.claim_next_at(t2 + secs(3600)).unwrap().is_none());
    }

    #[test]
    fn complete_is_idempotent() {
        let store = memory_store();
        store.enqueue("c", "true", 1).unwrap();
        store.claim_next().unwrap().unwrap();
        assert!(store.complete("c").unwrap());
        assert!(!store.complete("c").unwrap());
        assert!(!store.complete("missing").unwrap());
        assert_eq!(store.get("c").unwrap().unwrap().state, JobState::Completed);
    }

    #[test]
    fn terminal_jobs_ignore_late_resolutions() {
        let store = memory_store();
        store.enqueue("t", "true", 2).unwrap();
        store.claim_next().unwrap().unwrap();
        store.complete("t").unwrap();

        assert!(store.resolve_failure("t", "late").unwrap().is_none());
        assert!(!store.release("t").unwrap());
        let job = store.get("t").unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn pending_jobs_cannot_skip_processing() {
        let store = memory_store();
        store.enqueue("p", "true", 1).unwrap();

        assert!(!store.complete("p").unwrap());
        assert!(store.resolve_failure("p", "never ran").unwrap().is_none());
        assert!(!store.release("p").unwrap());

        let job = store.get("p").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn resolve_failure_on_missing_job_is_benign() {
        assert!(memory_store().resolve_failure("ghost", "x").unwrap().is_none());
    }

    #[test]
    fn long_errors_are_clipped() {
        let store = memory_store();
        store.enqueue("e", "false", 5).unwrap();
        store.claim_next().unwrap().unwrap();
        store.resolve_failure("e", &"é".repeat(5_000)).unwrap();
        let err = store.get("e").unwrap().unwrap().last_error.unwrap();
        assert_eq!(err.chars().count(), MAX_ERROR_CHARS);
    }

    #[test]
    fn release_keeps_attempts_and_makes_job_due() {
        let store = memory_store();
        store.enqueue("rel", "sleep 10", 2).unwrap();
        store.claim_next().unwrap().unwrap();
        assert!(store.release("rel").unwrap());

        let job = store.get("rel").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(store.claim_next().unwrap().unwrap().id, "rel");
    }

    #[test]
    fn expired_leases_consume_an_attempt() {
        let store = memory_store();
        let t0 = Utc::now() - secs(600);
        store.enqueue_at("stuck", "sleep 999", 2, t0).unwrap();
        store.enqueue_at("fresh", "sleep 999", 2, t0).unwrap();
        store.claim_next_at(t0).unwrap().unwrap();
        store.claim_next_at(t0 + secs(500)).unwrap().unwrap();

        let now = t0 + secs(600);
        let n = store.reclaim_expired_at(Duration::from_secs(300), now).unwrap();
        assert_eq!(n, 1);

        let stuck = store.get("stuck").unwrap().unwrap();
        assert_eq!(stuck.state, JobState::Pending);
        assert_eq!(stuck.attempts, 1);
        assert_eq!(stuck.last_error.as_deref(), Some("lease expired"));
        assert_eq!(store.get("fresh").unwrap().unwrap().state, JobState::Processing);

        // Second expiry exhausts max_retries = 2.
        store.claim_next_at(now + secs(3)).unwrap().unwrap();
        store.reclaim_expired_at(Duration::from_secs(300), now + secs(400)).unwrap();
        assert_eq!(store.get("stuck").unwrap().unwrap().state, JobState::Dead);
    }

    #[test]
    fn list_orders_by_creation_and_filters() {
        let store = memory_store();
        let t0 = Utc::now() - secs(100);
        for (i, id) in ["j1", "j2", "j3", "j4"].iter().enumerate() {
            store.enqueue_at(id, "true", 1, t0 + secs(i as i64)).unwrap();
        }
        // j1 dead, j2 completed, j3/j4 untouched
        store.claim_next().unwrap().unwrap();
        store.resolve_failure("j1", "exit=1").unwrap();
        store.claim_next().unwrap().unwrap();
        store.complete("j2").unwrap();

        let ids = |jobs: Vec<Job>| jobs.into_iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids(store.list(None).unwrap()), ["j1", "j2", "j3", "j4"]);
        assert_eq!(ids(store.list(Some(JobState::Dead)).unwrap()), ["j1"]);
        assert_eq!(ids(store.list(Some(JobState::Completed)).unwrap()), ["j2"]);
        assert_eq!(ids(store.list(Some(JobState::Pending)).unwrap()), ["j3", "j4"]);
        assert!(store.list(Some(JobState::Processing)).unwrap().is_empty());
    }

    #[test]
    fn failed_filter_selects_jobs_awaiting_retry() {
        let store = memory_store();
        store.enqueue_at("retrying", "false", 3, Utc::now() - secs(5)).unwrap();
        store.enqueue("untouched", "true", 3).unwrap();
        store.claim_next().unwrap().unwrap();
        store.resolve_failure("retrying", "exit=1").unwrap();

        let failed = store.list(Some(JobState::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "retrying");
        assert_eq!(failed[0].state, JobState::Pending);

        let counts = store.stats().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn normalize_rewrites_legacy_rows() {
        let store = memory_store();
        store
            .conn()
            .execute_batch(
                "INSERT INTO jobs VALUES
                 ('old', 'true', 'queued', 0, 3, '2025-11-08 10:00:00', '2025-11-08 10:00:00',
                  '2025-11-08T10:00:00Z', NULL);
                 INSERT INTO jobs VALUES
                 ('weird', 'true', 'pending', 0, 3, 'not-a-date', '2025-11-08 10:00:00',
                  '2025-11-08 10:00:00', NULL);",
            )
            .unwrap();

        let report = store.normalize_legacy().unwrap();
        assert_eq!(report.states_rewritten, 1);
        assert_eq!(report.timestamps_rewritten, 5);
        assert_eq!(report.timestamps_unparseable, 1);

        let old = store.get("old").unwrap().unwrap();
        assert_eq!(old.state, JobState::Pending);
        assert_eq!(format_ts(old.created_at), "2025-11-08T10:00:00.000000Z");
        assert!(matches!(store.get("weird"), Err(StoreError::Corrupt { .. })));
    }

    /// Schema and timestamp format written by older releases.
    fn legacy_connection(rows: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY, command TEXT NOT NULL, state TEXT NOT NULL,
                attempts INTEGER NOT NULL, max_retries INTEGER NOT NULL,
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                next_run_at TEXT NOT NULL
            );",
        )
        .unwrap();
        conn.execute_batch(rows).unwrap();
        conn
    }

    fn at(raw: &str) -> DateTime<Utc> {
        parse_ts(raw).unwrap()
    }

    #[test]
    fn legacy_retry_is_not_claimed_before_it_is_due() {
        let conn = legacy_connection(
            "INSERT INTO jobs VALUES ('retry-later', 'true', 'pending', 1, 3,
              '2026-10-19 00:00:00', '2026-10-19 00:00:00', '2026-10-19 23:00:00');",
        );
        let store = JobStore::new(conn, BackoffPolicy::default()).unwrap();

        assert!(store.claim_next_at(at("2026-10-19T01:00:00Z")).unwrap().is_none());
        let job = store.claim_next_at(at("2026-10-19T23:00:01Z")).unwrap().unwrap();
        assert_eq!(job.id, "retry-later");
        assert_eq!(job.next_run_at, at("2026-10-19T23:00:00Z"));
    }

    #[test]
    fn legacy_rows_keep_fifo_order_against_new_rows() {
        let conn = legacy_connection(
            "INSERT INTO jobs VALUES ('legacy', 'true', 'queued', 0, 3,
              '2026-10-19 10:00:00', '2026-10-19 10:00:00', '2026-10-19 10:00:00');
             INSERT INTO jobs VALUES ('canonical', 'true', 'pending', 0, 3,
              '2026-10-19T09:00:00.000000Z', '2026-10-19T09:00:00.000000Z',
              '2026-10-19T09:00:00.000000Z');",
        );
        let store = JobStore::new(conn, BackoffPolicy::default()).unwrap();

        let now = at("2026-10-19T12:00:00Z");
        assert_eq!(store.claim_next_at(now).unwrap().unwrap().id, "canonical");
        assert_eq!(store.claim_next_at(now).unwrap().unwrap().id, "legacy");

        let raw: String = store
            .conn()
            .query_row("SELECT created_at FROM jobs WHERE id = 'legacy'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, "2026-10-19T10:00:00.000000Z");
    }

    #[test]
    fn legacy_stamp_written_after_open_is_checked_when_claiming() {
        let store = memory_store();
        store
            .conn()
            .execute_batch(
                "INSERT INTO jobs VALUES ('late-writer', 'true', 'pending', 1, 3,
                  '2026-10-19 00:00:00', '2026-10-19 00:00:00', '2026-10-19 23:00:00', NULL);",
            )
            .unwrap();

        assert!(store.claim_next_at(at("2026-10-19T01:00:00Z")).unwrap().is_none());
        assert!(store.claim_next_at(at("2026-10-20T00:00:00Z")).unwrap().is_some());
    }

    #[test]
    fn unknown_state_is_reported_as_corrupt() {
        let store = memory_store();
        store
            .conn()
            .execute(
                "INSERT INTO jobs VALUES ('bad', 'true', 'exploded', 0, 1, ?1, ?1, ?1, NULL)",
                [format_ts(Utc::now())],
            )
            .unwrap();
        let err = store.list(None).unwrap_err();
        assert!(err.is_fatal());
        // Other rows stay claimable; only decoding the bad row fails.
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn concurrent_claimers_never_share_a_job() {
        const JOBS: usize = 40;
        const CLAIMERS: usize = 6;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let timeout = Duration::from_secs(10);
        {
            let store = JobStore::open(&path, timeout, BackoffPolicy::default()).unwrap();
            let t0 = Utc::now() - secs(60);
            for i in 0..JOBS {
                store.enqueue_at(&format!("job-{i:03}"), "true", 1, t0 + secs(i as i64)).unwrap();
            }
        }

        let barrier = Arc::new(Barrier::new(CLAIMERS));
        let handles: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let store = JobStore::open(&path, timeout, BackoffPolicy::default()).unwrap();
                    barrier.wait();
                    let mut mine = Vec::new();
                    while let Some(job) = store.claim_next().unwrap() {
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id.clone()), "{id} claimed twice");
            }
        }
        assert_eq!(total, JOBS);
        assert_eq!(seen.len(), JOBS);
    }
}
