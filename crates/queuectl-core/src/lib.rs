//! `queuectl-core`: configuration and shared error types used by every
//! queuectl crate.

pub mod config;
pub mod error;

pub use config::QueueConfig;
pub use error::{CoreError, Result};
