use thiserror::Error;

/// Errors that can occur within the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error. Lock contention (`SQLITE_BUSY`) and
    /// I/O hiccups land here and are safe to retry on the next poll.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A job with this id already exists; nothing was written.
    #[error("Job with id {id} already exists")]
    DuplicateId { id: String },

    /// The enqueue payload was rejected before touching the database.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// A stored row could not be decoded (unknown state, bad timestamp).
    #[error("Corrupt job row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    /// True for errors that will not go away by polling again.
    pub fn is_fatal(&self) -> bool {
        use rusqlite::ErrorCode;
        match self {
            StoreError::Corrupt { .. } => true,
            StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
