use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Column order shared by every SELECT that feeds `store::row_to_raw`.
pub(crate) const JOB_COLUMNS: &str =
    "id, command, state, attempts, max_retries, created_at, updated_at, next_run_at, last_error";

/// Initialise the queue schema in `conn`.
///
/// Creates the `jobs` table (idempotent) plus the indexes behind the claim
/// and listing queries. Tables created by older releases lack `last_error`;
/// it is added in place.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            command     TEXT    NOT NULL,
            state       TEXT    NOT NULL,
            attempts    INTEGER NOT NULL,
            max_retries INTEGER NOT NULL,
            created_at  TEXT    NOT NULL,   -- RFC 3339, microsecond precision
            updated_at  TEXT    NOT NULL,
            next_run_at TEXT    NOT NULL,
            last_error  TEXT
        ) STRICT;

        -- Claim: WHERE state = 'pending' AND next_run_at <= ?  ORDER BY created_at
        CREATE INDEX IF NOT EXISTS idx_jobs_state_next_run ON jobs (state, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at);
        ",
    )?;
    if !has_column(conn, "jobs", "last_error")? {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN last_error TEXT;")?;
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|n| n == column))
}

/// Canonical on-disk timestamp: `2026-10-19T12:00:00.000000Z`.
///
/// Fixed width, so string order in SQL equals chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Accepts the canonical format, any RFC 3339
/// string, and SQLite's `datetime('now')` output (`YYYY-MM-DD HH:MM:SS`,
/// assumed UTC).
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
