//! `queuectl-store`: durable SQLite job table with atomic claim semantics.
//!
//! # Overview
//!
//! Jobs live in a single `jobs` table. Workers call [`JobStore::claim_next`]
//! which, inside a `BEGIN IMMEDIATE` transaction, picks the oldest eligible
//! `pending` job and flips it to `processing`. Outcomes are recorded with
//! [`JobStore::complete`] or [`JobStore::resolve_failure`]; the latter asks the
//! [`BackoffPolicy`] whether to retry later or dead-letter the job.
//!
//! # State machine
//!
//! | From         | Event                                   | To          |
//! |--------------|-----------------------------------------|-------------|
//! | (none)       | enqueue                                 | `pending`   |
//! | `pending`    | claimed                                 | `processing`|
//! | `processing` | succeeded                               | `completed` |
//! | `processing` | failed, `attempts + 1 <  max_retries`   | `pending`   |
//! | `processing` | failed, `attempts + 1 >= max_retries`   | `dead`      |
//! | `processing` | released on shutdown                    | `pending`   |

pub mod backoff;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use backoff::{BackoffPolicy, FailureOutcome};
pub use error::{Result, StoreError};
pub use store::JobStore;
pub use types::{Job, JobState, NormalizeReport, StateCounts};
