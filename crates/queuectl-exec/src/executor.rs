//! Command executors.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::{ExecError, Result},
    truncate::{self, DEFAULT_MAX_CHARS},
    types::ExecResult,
};

/// Runs one job command and reports how it exited.
///
/// A non-zero exit is a normal `Ok` result; `Err` means no exit status was
/// obtained (spawn failure, timeout, I/O error).
///
/// Dropping the returned future must stop the command. The worker relies on
/// this to abort in-flight jobs on shutdown.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult>;
}

/// Executes commands through `sh -c` with `tokio::process`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    max_output_chars: usize,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS)
    }
}

impl ShellExecutor {
    pub fn new(max_output_chars: usize) -> Self {
        Self {
            shell: "sh".to_string(),
            max_output_chars,
        }
    }

    /// Use a different shell binary; it must accept `-c <command>`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult> {
        debug!("exec: {command}");

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so everything the shell forks can be killed
        // together.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", self.shell)))?;
        // Kills the group unless the command exits on its own.
        let mut group = GroupKill::new(child.id());

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                group.disarm();
                let exit_code = output.status.code().unwrap_or(-1);
                Ok(ExecResult {
                    exit_code,
                    stdout: self.clean(&output.stdout),
                    stderr: self.clean(&output.stderr),
                })
            }
            Ok(Err(e)) => Err(ExecError::Io(e)),
            Err(_elapsed) => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(timeout_ms = ms, "command timed out, child killed");
                Err(ExecError::Timeout { ms })
            }
        }
    }
}

/// SIGKILLs a child's process group when dropped, unless disarmed.
///
/// `kill_on_drop` only reaches the `sh` process itself; grandchildren of a
/// compound command (`sleep 100 && echo x`) would otherwise outlive it.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        if let Ok(pgid) = libc::pid_t::try_from(pgid) {
            // Safety: the child was spawned with process_group(0), so its pid
            // is the id of a group containing only its own descendants.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl ShellExecutor {
    /// Strip ANSI escape codes, decode lossily, and bound the length.
    fn clean(&self, raw: &[u8]) -> String {
        let stripped = strip_ansi_escapes::strip(raw);
        truncate::truncate_output(&String::from_utf8_lossy(&stripped), self.max_output_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const T: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let result = ShellExecutor::default().run("echo hello", T).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn reports_nonzero_exit_with_stderr() {
        let result = ShellExecutor::default()
            .run("echo oops >&2; exit 3", T)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.diagnostic(), "oops");
    }

    #[tokio::test]
    async fn strips_ansi_sequences() {
        let result = ShellExecutor::default()
            .run(r"printf '\033[31mred\033[0m'", T)
            .await
            .unwrap();
        assert_eq!(result.stdout, "red");
    }

    #[tokio::test]
    async fn truncates_long_output() {
        let result = ShellExecutor::new(20)
            .run("yes x | head -n 1000", T)
            .await
            .unwrap();
        assert!(result.stdout.contains("chars truncated"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = Instant::now();
        let err = ShellExecutor::default()
            .run("sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { ms: 200 }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_background_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let command = format!("(sleep 1; touch '{}') & wait", marker.display());

        let err = ShellExecutor::default()
            .run(&command, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists(), "grandchild survived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_the_run_future_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let command = format!("(sleep 1; touch '{}') & wait", marker.display());
        let executor = ShellExecutor::default();

        let aborted = tokio::time::timeout(Duration::from_millis(200), executor.run(&command, T)).await;
        assert!(aborted.is_err());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists(), "grandchild survived the dropped future");
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let err = ShellExecutor::default()
            .with_shell("/definitely/not/a/shell")
            .run("true", T)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }
}
