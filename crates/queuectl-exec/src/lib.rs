//! queuectl-exec: the "run a command, report its exit status" capability.
//!
//! Workers never spawn processes directly; they hold a
//! [`CommandExecutor`] so tests can swap in a fake.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use queuectl_exec::{CommandExecutor, ShellExecutor};
//!
//! #[tokio::main]
//! async fn main() {
//!     let exec = ShellExecutor::default();
//!     let result = exec.run("echo hello", Duration::from_secs(30)).await.unwrap();
//!     assert!(result.success());
//!     println!("{}", result.stdout);
//! }
//! ```

pub mod error;
pub mod executor;
pub mod truncate;
pub mod types;

pub use error::{ExecError, Result};
pub use executor::{CommandExecutor, ShellExecutor};
pub use types::ExecResult;
