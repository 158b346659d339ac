//! Retryable/fatal classification of failed executions.

use super::ExecutionResult;
use crate::core::AttemptOutcome;
use regex::Regex;

/// `STATUS_STACK_BUFFER_OVERRUN` (`0xC0000409`), the crash the stereo stage
/// hits on Windows GPU drivers. Reported as `3221226505` or `-1073740791`
/// depending on how the exit status is read.
pub const STACK_BUFFER_OVERRUN: u32 = 0xC000_0409;

/// A transient failure signature.
#[derive(Debug, Clone)]
pub enum FailureSignature {
    /// Matches a specific exit status, compared as a 32-bit pattern so that
    /// signed and unsigned renderings of Windows status codes both match.
    ExitCode {
        /// The status code.
        code: u32,
        /// Human-readable name.
        name: String,
    },
    /// Matches a regular expression against standard error.
    Stderr {
        /// Pattern applied to the full stderr text.
        pattern: Regex,
        /// Human-readable name.
        name: String,
    },
}

impl FailureSignature {
    /// Creates an exit code signature.
    #[must_use]
    pub fn exit_code(code: u32, name: impl Into<String>) -> Self {
        Self::ExitCode {
            code,
            name: name.into(),
        }
    }

    /// Creates a stderr pattern signature.
    pub fn stderr(pattern: &str, name: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self::Stderr {
            pattern: Regex::new(pattern)?,
            name: name.into(),
        })
    }

    /// Returns the signature name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ExitCode { name, .. } | Self::Stderr { name, .. } => name,
        }
    }

    fn matches(&self, result: &ExecutionResult) -> bool {
        match self {
            Self::ExitCode { code, .. } => result
                .exit_status
                .is_some_and(|status| status_bits(status) == *code),
            Self::Stderr { pattern, .. } => pattern.is_match(&result.stderr),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn status_bits(status: i64) -> u32 {
    status as u32
}

/// Decides whether a failed execution may be retried with the next variant.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    signatures: Vec<FailureSignature>,
    timeout_retryable: bool,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            signatures: vec![FailureSignature::exit_code(
                STACK_BUFFER_OVERRUN,
                "stack buffer overrun",
            )],
            timeout_retryable: false,
        }
    }
}

/// The classification of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The outcome.
    pub outcome: AttemptOutcome,
    /// Name of the matched signature or a short reason.
    pub reason: Option<String>,
}

impl FailureClassifier {
    /// Creates a classifier with no signatures; every failure is fatal.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
            timeout_retryable: false,
        }
    }

    /// Adds a signature.
    #[must_use]
    pub fn with_signature(mut self, signature: FailureSignature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Treats timeouts as retryable.
    #[must_use]
    pub fn with_timeout_retryable(mut self, retryable: bool) -> Self {
        self.timeout_retryable = retryable;
        self
    }

    /// Returns the registered signatures.
    #[must_use]
    pub fn signatures(&self) -> &[FailureSignature] {
        &self.signatures
    }

    /// Classifies an execution result.
    #[must_use]
    pub fn classify(&self, result: &ExecutionResult) -> Classification {
        if result.success() {
            return Classification {
                outcome: AttemptOutcome::Succeeded,
                reason: None,
            };
        }

        if result.cancelled {
            return Classification {
                outcome: AttemptOutcome::FailedFatal,
                reason: Some("cancelled".to_string()),
            };
        }

        if result.timed_out {
            let outcome = if self.timeout_retryable {
                AttemptOutcome::FailedRetryable
            } else {
                AttemptOutcome::FailedFatal
            };
            return Classification {
                outcome,
                reason: Some("timed out".to_string()),
            };
        }

        match self.signatures.iter().find(|s| s.matches(result)) {
            Some(signature) => Classification {
                outcome: AttemptOutcome::FailedRetryable,
                reason: Some(signature.name().to_string()),
            },
            None => Classification {
                outcome: AttemptOutcome::FailedFatal,
                reason: None,
            },
        }
    }
}
