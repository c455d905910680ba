use queuectl_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A blocking store call panicked.
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WorkerError {
    /// Fatal errors stop the worker; everything else is retried next poll.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_fatal(),
            WorkerError::Join(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
