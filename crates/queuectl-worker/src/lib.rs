//! `queuectl-worker`: the claim → execute → resolve loop.
//!
//! A [`Worker`] owns a handle to the store, an executor and a
//! cancellation token. It processes one job at a time; run several (see
//! [`WorkerPool`]) to process jobs in parallel. Claim exclusivity is
//! entirely the store's job.

pub mod error;
pub mod pool;
pub mod worker;

pub use error::WorkerError;
pub use pool::WorkerPool;
pub use worker::{Worker, WorkerOptions, WorkerReport};
