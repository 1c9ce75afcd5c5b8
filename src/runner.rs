//! Paced execution of shell commands.
//!
//! Backs the `pacer run` subcommand: each input line is a shell command that
//! is submitted to a [`RateLimiter`], so scripted calls against a rate-limited
//! API (curl invocations, sync jobs) are spaced out and retried.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::error::{ExecuteError, Result};
use crate::ratelimit::{Execution, RateLimiter};

/// Shell used to interpret command lines.
const DEFAULT_SHELL: &str = "sh";

/// Why a single command attempt failed.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell could not be started
    #[error("failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    /// The command ran and exited unsuccessfully
    #[error("{0}")]
    Exit(ExitStatus),
}

/// Where a command's standard output goes.
///
/// Never the runner's stdout, which carries the reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildOutput {
    /// Forward to the runner's stderr, next to the logs
    #[default]
    Stderr,
    /// Discard
    Null,
}

impl ChildOutput {
    fn stdio(self) -> Stdio {
        match self {
            Self::Stderr => std::io::stderr().into(),
            Self::Null => Stdio::null(),
        }
    }
}

/// Outcome of one submitted command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    /// 1-based position among submitted commands
    pub index: usize,
    /// The command line as submitted
    pub command: String,
    /// Whether the command eventually succeeded
    pub ok: bool,
    /// Exit status or failure reason
    pub detail: String,
}

impl CommandReport {
    fn new(
        index: usize,
        command: String,
        outcome: std::result::Result<ExitStatus, ExecuteError<CommandError>>,
    ) -> Self {
        let (ok, detail) = match outcome {
            Ok(status) => (true, status.to_string()),
            Err(err) => (false, err.to_string()),
        };
        Self {
            index,
            command,
            ok,
            detail,
        }
    }
}

impl fmt::Display for CommandReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.ok { "ok" } else { "FAILED" };
        write!(f, "[{}] {} {} ({})", self.index, verdict, self.command, self.detail)
    }
}

/// Submits shell commands through a rate limiter.
pub struct CommandRunner {
    limiter: Arc<RateLimiter>,
    shell: String,
    output: ChildOutput,
}

impl CommandRunner {
    /// Create a runner that uses `sh -c`.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            shell: DEFAULT_SHELL.to_string(),
            output: ChildOutput::default(),
        }
    }

    /// Use a different shell binary; it must accept `-c <command>`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Redirect the standard output of commands.
    pub fn with_output(mut self, output: ChildOutput) -> Self {
        self.output = output;
        self
    }

    /// Queue one command. It is re-run on each retry.
    pub fn submit(&self, command: &str) -> Execution<ExitStatus, CommandError> {
        let shell = self.shell.clone();
        let command = command.to_string();
        let output = self.output;
        self.limiter.execute(move || {
            let shell = shell.clone();
            let command = command.clone();
            async move { run_shell(&shell, &command, output).await }
        })
    }

    /// Submit every command line from `reader` until EOF or `shutdown`
    /// resolves, then wait for all submitted commands to settle.
    ///
    /// Blank lines and lines starting with `#` are skipped. Reports come back
    /// in submission order.
    pub async fn run_lines<R, S>(&self, reader: R, shutdown: S) -> Result<Vec<CommandReport>>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = LinesStream::new(reader.lines());
        tokio::pin!(shutdown);

        let mut submitted = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(
                        pending = submitted.len(),
                        "Shutdown requested, no longer reading commands"
                    );
                    break;
                }
                line = lines.next() => {
                    let Some(line) = line else { break };
                    let line = line?;
                    let command = line.trim();
                    if command.is_empty() || command.starts_with('#') {
                        continue;
                    }
                    debug!(command = %command, "Submitting command");
                    submitted.push((command.to_string(), self.submit(command)));
                }
            }
        }

        let outcomes = futures::future::join_all(
            submitted
                .into_iter()
                .map(|(command, execution)| async move { (command, execution.await) }),
        )
        .await;

        Ok(outcomes
            .into_iter()
            .enumerate()
            .map(|(i, (command, outcome))| CommandReport::new(i + 1, command, outcome))
            .collect())
    }
}

async fn run_shell(
    shell: &str,
    command: &str,
    output: ChildOutput,
) -> std::result::Result<ExitStatus, CommandError> {
    let status = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(output.stdio())
        .status()
        .await
        .map_err(CommandError::Spawn)?;

    if status.success() {
        Ok(status)
    } else {
        debug!(command = %command, status = %status, "Command exited unsuccessfully");
        Err(CommandError::Exit(status))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn runner(max_retries: u32) -> CommandRunner {
        let limiter = RateLimiter::with_retries(
            Duration::from_millis(1),
            max_retries,
            Duration::from_millis(1),
        );
        CommandRunner::new(Arc::new(limiter))
    }

    #[tokio::test]
    async fn test_reports_in_submission_order() {
        let runner = runner(0);
        let input: &[u8] = b"true\n\n# skipped\nexit 3\n  true  \n";

        let reports = runner
            .run_lines(input, std::future::pending())
            .await
            .unwrap();

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].command, "true");
        assert!(reports[0].ok);
        assert_eq!(reports[1].command, "exit 3");
        assert!(!reports[1].ok);
        assert!(reports[1].detail.contains('3'));
        assert_eq!(reports[2].index, 3);
        assert!(reports[2].ok);
    }

    #[tokio::test]
    async fn test_failed_command_is_retried() {
        let marker = std::env::temp_dir().join(format!("pacer-retry-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let command = format!(
            "test -f {path} || {{ touch {path}; exit 1; }}",
            path = marker.display()
        );

        let limiter = Arc::new(RateLimiter::with_retries(
            Duration::from_millis(1),
            2,
            Duration::from_millis(1),
        ));
        let runner = CommandRunner::new(limiter.clone());
        let result = runner.submit(&command).await;
        let _ = std::fs::remove_file(&marker);

        assert!(result.unwrap().success());
        assert_eq!(limiter.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reading() {
        let runner = runner(0);
        let input: &[u8] = b"true\ntrue\n";

        let reports = runner.run_lines(input, std::future::ready(())).await.unwrap();

        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_missing_shell_reports_spawn_failure() {
        let runner = runner(1).with_shell("/nonexistent/shell");

        let err = runner.submit("true").await.unwrap_err();

        assert!(matches!(
            err,
            ExecuteError::Operation(CommandError::Spawn(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_stdout_goes_to_stderr() {
        let runner = runner(0);

        let status = runner
            .submit(r#"[ "$(readlink /proc/$$/fd/1)" = "$(readlink /proc/$$/fd/2)" ]"#)
            .await;

        assert!(status.unwrap().success());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_stdout_can_be_discarded() {
        let runner = runner(0).with_output(ChildOutput::Null);

        let status = runner
            .submit(r#"[ "$(readlink /proc/$$/fd/1)" = /dev/null ]"#)
            .await;

        assert!(status.unwrap().success());
    }

    #[test]
    fn test_report_display() {
        let report = CommandReport {
            index: 2,
            command: "curl example".to_string(),
            ok: false,
            detail: "exit status: 1".to_string(),
        };
        assert_eq!(report.to_string(), "[2] FAILED curl example (exit status: 1)");
    }
}
