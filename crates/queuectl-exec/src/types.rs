//! Shared data types for queuectl-exec.

use serde::{Deserialize, Serialize};

/// Exit status and captured output of one command run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured standard output, ANSI escapes stripped.
    pub stdout: String,

    /// Captured standard error, ANSI escapes stripped.
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best single-line explanation of a failed run: stderr if any, else
    /// stdout, else the bare exit code.
    pub fn diagnostic(&self) -> String {
        [&self.stderr, &self.stdout]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit={}", self.exit_code))
    }
}
