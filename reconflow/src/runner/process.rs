//! Subprocess execution.

use super::{CommandLine, ExecutionResult};
use crate::cancellation::CancellationToken;
use crate::errors::RunnerError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Executes one external operation and reports its outcome.
///
/// A non-zero exit status is returned, not raised; only failures of the
/// runner itself (spawn, wait) are errors.
#[async_trait]
pub trait CommandRunner: Send + Sync + Debug {
    /// Runs `command` to completion in `working_directory`.
    async fn execute(
        &self,
        command: &CommandLine,
        working_directory: Option<&Path>,
    ) -> Result<ExecutionResult, RunnerError>;
}

/// Runs commands as child processes of the current process.
///
/// The child is killed when the command's timeout expires, when the
/// cancellation token fires, or when the execution future is dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    cancel: CancellationToken,
}

const KILL_GRACE: Duration = Duration::from_secs(2);

enum Exit {
    Status(ExitStatus),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    /// Creates a runner bound to a cancellation token.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(
        &self,
        command: &CommandLine,
        working_directory: Option<&Path>,
    ) -> Result<ExecutionResult, RunnerError> {
        let program = command.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_directory {
            cmd.current_dir(dir);
        }

        info!(command = %command, "Running external command");
        let start = Instant::now();

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let deadline = async {
            match command.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status.map_err(|source| RunnerError::Wait {
                program: program.clone(),
                source,
            })?),
            () = deadline => Exit::TimedOut,
            () = self.cancel.cancelled() => Exit::Cancelled,
        };

        if matches!(exit, Exit::TimedOut | Exit::Cancelled) {
            if let Err(e) = child.kill().await {
                warn!(program = %program, error = %e, "Failed to kill child process");
            }
        }

        // A killed child may leave grandchildren holding the pipes open.
        let grace = match exit {
            Exit::Status(_) => None,
            Exit::TimedOut | Exit::Cancelled => Some(KILL_GRACE),
        };
        let stdout = join_reader(stdout, grace).await;
        let stderr = join_reader(stderr, grace).await;
        let duration = start.elapsed();

        let result = match exit {
            Exit::Status(status) => ExecutionResult {
                exit_status: status.code().map(i64::from),
                signal: exit_signal(status),
                stdout,
                stderr,
                duration,
                timed_out: false,
                cancelled: false,
            },
            Exit::TimedOut => ExecutionResult {
                stdout,
                stderr,
                duration,
                timed_out: true,
                ..ExecutionResult::default()
            },
            Exit::Cancelled => ExecutionResult {
                stdout,
                stderr,
                duration,
                cancelled: true,
                ..ExecutionResult::default()
            },
        };

        log_result(&program, &result);
        Ok(result)
    }
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buf).await {
                debug!(error = %e, "Output stream closed with error");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn join_reader(handle: JoinHandle<String>, grace: Option<Duration>) -> String {
    match grace {
        None => handle.await.unwrap_or_default(),
        Some(grace) => match tokio::time::timeout(grace, handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => String::new(),
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

fn log_result(program: &str, result: &ExecutionResult) {
    let duration_ms = duration_ms(result.duration);
    if result.success() {
        info!(program = %program, duration_ms, "External command succeeded");
    } else {
        warn!(
            program = %program,
            duration_ms,
            outcome = %result.describe(),
            "External command failed"
        );
    }
    if !result.stdout.is_empty() {
        debug!(program = %program, stdout = %result.stdout.trim_end(), "Captured stdout");
    }
    if !result.stderr.is_empty() {
        debug!(program = %program, stderr = %result.stderr.trim_end(), "Captured stderr");
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_output_and_status() {
        let runner = ProcessRunner::default();
        let result = runner
            .execute(&sh("echo out; echo err 1>&2; exit 3"), None)
            .await
            .unwrap();

        assert_eq!(result.exit_status, Some(3));
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_working_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("marker.txt"), "here").unwrap();

        let runner = ProcessRunner::default();
        let result = runner.execute(&sh("cat marker.txt"), Some(tmp.path())).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "here");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let runner = ProcessRunner::default();
        let err = runner
            .execute(&CommandLine::new("/definitely/not/a/program"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let runner = ProcessRunner::default();
        let cmd = sh("exec sleep 30").with_timeout(Some(Duration::from_millis(100)));

        let started = Instant::now();
        let result = runner.execute(&cmd, None).await.unwrap();

        assert!(result.timed_out);
        assert!(result.exit_status.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let token = CancellationToken::new();
        let runner = ProcessRunner::new(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel("test");
        });

        let started = Instant::now();
        let result = runner.execute(&sh("exec sleep 30"), None).await.unwrap();
        canceller.await.unwrap();

        assert!(result.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
