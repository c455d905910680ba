//! Error types for the queuectl-exec crate.

use thiserror::Error;

/// Ways a command can fail to produce an exit status.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The shell could not be started.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Reading the child's output or waiting on it failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The child outlived its time budget and was killed.
    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ExecError>;
