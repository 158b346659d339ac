//! Stage state and attempt outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a stage within one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Stage has not been considered yet.
    Pending,
    /// Stage outputs already resolved on entry; the action was not invoked.
    AlreadyComplete,
    /// Stage action is executing.
    Running,
    /// Stage action succeeded and its outputs verified.
    Succeeded,
    /// Stage failed; terminal for this run.
    Failed,
    /// Stage was not attempted because of an upstream failure or a stop policy.
    Blocked,
    /// Stage was interrupted by cancellation.
    Cancelled,
}

impl Default for StageState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::AlreadyComplete => write!(f, "already_complete"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageState {
    /// Returns true if the state is final for this run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if downstream stages may rely on this stage's outputs.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Succeeded | Self::AlreadyComplete)
    }

    /// Returns true if the stage ended in failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// Classified outcome of one invocation of a stage action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The action completed with a success status.
    Succeeded,
    /// The action failed with a known transient signature; the next variant may run.
    FailedRetryable,
    /// The action failed for any other reason; no further variants run.
    FailedFatal,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::FailedRetryable => write!(f, "failed-retryable"),
            Self::FailedFatal => write!(f, "failed-fatal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_display() {
        assert_eq!(StageState::AlreadyComplete.to_string(), "already_complete");
        assert_eq!(StageState::Failed.to_string(), "failed");
        assert_eq!(StageState::Blocked.to_string(), "blocked");
    }

    #[test]
    fn test_stage_state_predicates() {
        assert!(StageState::Succeeded.is_satisfied());
        assert!(StageState::AlreadyComplete.is_satisfied());
        assert!(!StageState::Failed.is_satisfied());
        assert!(!StageState::Blocked.is_satisfied());

        assert!(!StageState::Pending.is_terminal());
        assert!(!StageState::Running.is_terminal());
        assert!(StageState::Blocked.is_terminal());

        assert!(StageState::Cancelled.is_failure());
        assert!(!StageState::Blocked.is_failure());
    }

    #[test]
    fn test_attempt_outcome_serialize() {
        let json = serde_json::to_string(&AttemptOutcome::FailedRetryable).unwrap();
        assert_eq!(json, r#""failed_retryable""#);
        assert_eq!(AttemptOutcome::FailedRetryable.to_string(), "failed-retryable");
    }
}
