//! Record of a single stage action invocation.

use super::AttemptOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One invocation of a stage action with one parameter variant.
///
/// Attempts are created by the fallback policy and only survive as part of
/// the run report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionAttempt {
    /// Stage that was executed.
    pub stage_name: String,
    /// Position of the variant in the stage's variant list.
    pub variant_index: usize,
    /// Human-readable variant label.
    pub variant_label: String,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    /// When the invocation ended.
    pub ended_at: DateTime<Utc>,
    /// Classified outcome.
    pub outcome: AttemptOutcome,
    /// Exit status of the external process, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i64>,
    /// Captured standard output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    /// Captured standard error.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Short diagnostic message (classification reason or collaborator error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionAttempt {
    /// Returns the wall-clock duration of the attempt in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Describes the exit of the attempt for reports.
    #[must_use]
    pub fn describe_exit(&self) -> String {
        match (self.exit_status, &self.message) {
            (Some(code), Some(msg)) => format!("exit status {code} ({msg})"),
            (Some(code), None) => format!("exit status {code}"),
            (None, Some(msg)) => msg.clone(),
            (None, None) => self.outcome.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(exit_status: Option<i64>, message: Option<&str>) -> ExecutionAttempt {
        let now = Utc::now();
        ExecutionAttempt {
            stage_name: "dense_stereo".to_string(),
            variant_index: 0,
            variant_label: "gpu".to_string(),
            started_at: now,
            ended_at: now + chrono::Duration::milliseconds(1500),
            outcome: AttemptOutcome::FailedRetryable,
            exit_status,
            stdout: String::new(),
            stderr: String::new(),
            message: message.map(String::from),
        }
    }

    #[test]
    fn test_duration() {
        assert_eq!(attempt(None, None).duration_ms(), 1500);
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(
            attempt(Some(3_221_226_505), Some("stack buffer overrun")).describe_exit(),
            "exit status 3221226505 (stack buffer overrun)"
        );
        assert_eq!(attempt(Some(1), None).describe_exit(), "exit status 1");
        assert_eq!(attempt(None, Some("timed out")).describe_exit(), "timed out");
        assert_eq!(attempt(None, None).describe_exit(), "failed-retryable");
    }

    #[test]
    fn test_empty_streams_not_serialized() {
        let json = serde_json::to_value(attempt(Some(1), None)).unwrap();
        assert!(json.get("stdout").is_none());
        assert!(json.get("message").is_none());
        assert_eq!(json["exit_status"], 1);
    }
}
