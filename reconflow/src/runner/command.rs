//! Command lines and execution results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A fully-specified external command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Kill the process if it runs longer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl CommandLine {
    /// Creates a command with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends `--key value`.
    #[must_use]
    pub fn flag(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.args.push(format!("--{key}"));
        self.args.push(value.to_string());
        self
    }

    /// Appends `--key true|false`, the engine's boolean encoding.
    #[must_use]
    pub fn bool_flag(self, key: &str, value: bool) -> Self {
        self.flag(key, if value { "true" } else { "false" })
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the value following `--key`, if present.
    #[must_use]
    pub fn flag_value(&self, key: &str) -> Option<&str> {
        let needle = format!("--{key}");
        self.args
            .iter()
            .position(|a| *a == needle)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if s.is_empty() || s.contains(char::is_whitespace) {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

/// The captured outcome of one external process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Numeric exit status; `None` if the process was killed or terminated by a signal.
    pub exit_status: Option<i64>,
    /// Terminating signal on Unix-like systems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Full standard output.
    pub stdout: String,
    /// Full standard error.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// The process was killed because its timeout expired.
    #[serde(default)]
    pub timed_out: bool,
    /// The process was killed because the run was cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

impl ExecutionResult {
    /// A successful result with no output, used by in-process collaborator calls.
    #[must_use]
    pub fn in_process_success(duration: Duration) -> Self {
        Self {
            exit_status: Some(0),
            duration,
            ..Self::default()
        }
    }

    /// Returns true if the process exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Describes how the process ended.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.cancelled {
            "killed after cancellation".to_string()
        } else if self.timed_out {
            format!("killed after timeout ({:.1}s)", self.duration.as_secs_f64())
        } else if let Some(code) = self.exit_status {
            format!("exit status {code}")
        } else if let Some(signal) = self.signal {
            format!("terminated by signal {signal}")
        } else {
            "terminated without exit status".to_string()
        }
    }
}
