//! Ordered parameter-variant fallback for a single stage.

use super::StageSpec;
use crate::core::{AttemptOutcome, ExecutionAttempt};
use crate::errors::{ExternalProcessError, FallbackExhaustedError};
use crate::runner::{ExecutionResult, FailureClassifier};
use crate::stages::{ActionContext, ParameterVariant};
use chrono::Utc;
use tracing::{info, warn};

/// How a fallback sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackResult {
    /// A variant succeeded; outputs still need verification.
    Succeeded {
        /// Index of the successful variant.
        variant_index: usize,
    },
    /// A variant failed with a fatal classification; later variants were skipped.
    Fatal(ExternalProcessError),
    /// Every variant failed with a retryable classification.
    Exhausted(FallbackExhaustedError),
    /// The run was cancelled during or before an attempt.
    Cancelled,
}

/// The attempts made and how the sequence ended.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    /// One record per invocation, in order.
    pub attempts: Vec<ExecutionAttempt>,
    /// Final result.
    pub result: FallbackResult,
}

/// Invokes a stage action once per parameter variant until one succeeds,
/// a failure is classified fatal, or the variants run out.
#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    classifier: FailureClassifier,
}

impl FallbackPolicy {
    /// Creates a policy using `classifier`.
    #[must_use]
    pub fn new(classifier: FailureClassifier) -> Self {
        Self { classifier }
    }

    /// Runs the stage's variants in declaration order.
    pub async fn run(&self, stage: &StageSpec, ctx: &ActionContext<'_>) -> FallbackOutcome {
        let mut attempts = Vec::with_capacity(stage.variants().len());
        let total = stage.variants().len();

        for (index, variant) in stage.variants().iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return FallbackOutcome {
                    attempts,
                    result: FallbackResult::Cancelled,
                };
            }

            info!(
                stage = %stage.name,
                variant = %variant.label,
                attempt = index + 1,
                of = total,
                "Invoking stage action"
            );

            let started_at = Utc::now();
            let invoked = stage.action.invoke(variant, ctx).await;
            let ended_at = Utc::now();
            let cancelled = matches!(&invoked, Ok(result) if result.cancelled);

            let attempt = match invoked {
                Ok(result) => self.record(stage, index, variant, started_at, ended_at, &result),
                Err(e) => ExecutionAttempt {
                    stage_name: stage.name.clone(),
                    variant_index: index,
                    variant_label: variant.label.clone(),
                    started_at,
                    ended_at,
                    outcome: AttemptOutcome::FailedFatal,
                    exit_status: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    message: Some(e.message),
                },
            };
            let outcome = attempt.outcome;
            attempts.push(attempt);

            match outcome {
                AttemptOutcome::Succeeded => {
                    return FallbackOutcome {
                        attempts,
                        result: FallbackResult::Succeeded {
                            variant_index: index,
                        },
                    };
                }
                AttemptOutcome::FailedFatal if cancelled => {
                    return FallbackOutcome {
                        attempts,
                        result: FallbackResult::Cancelled,
                    };
                }
                AttemptOutcome::FailedFatal => {
                    let error = fatal_error(stage, &attempts);
                    warn!(stage = %stage.name, variant = %variant.label, error = %error, "Stage action failed fatally");
                    return FallbackOutcome {
                        attempts,
                        result: FallbackResult::Fatal(error),
                    };
                }
                AttemptOutcome::FailedRetryable => {
                    if index + 1 < total {
                        warn!(
                            stage = %stage.name,
                            variant = %variant.label,
                            next = %stage.variants()[index + 1].label,
                            "Retryable failure, falling back to next variant"
                        );
                    }
                }
            }
        }

        let last_failure = attempts
            .last()
            .map_or_else(|| "no variants".to_string(), ExecutionAttempt::describe_exit);
        warn!(stage = %stage.name, attempts = attempts.len(), "All parameter variants exhausted");

        FallbackOutcome {
            result: FallbackResult::Exhausted(FallbackExhaustedError {
                stage: stage.name.clone(),
                attempts: attempts.len(),
                last_failure,
            }),
            attempts,
        }
    }

    fn record(
        &self,
        stage: &StageSpec,
        index: usize,
        variant: &ParameterVariant,
        started_at: chrono::DateTime<Utc>,
        ended_at: chrono::DateTime<Utc>,
        result: &ExecutionResult,
    ) -> ExecutionAttempt {
        let classification = self.classifier.classify(result);
        let message = match (&classification.reason, result.success()) {
            (_, true) => None,
            (Some(reason), false) => Some(reason.clone()),
            (None, false) if result.exit_status.is_none() => Some(result.describe()),
            (None, false) => None,
        };

        ExecutionAttempt {
            stage_name: stage.name.clone(),
            variant_index: index,
            variant_label: variant.label.clone(),
            started_at,
            ended_at,
            outcome: classification.outcome,
            exit_status: result.exit_status,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            message,
        }
    }
}

fn fatal_error(stage: &StageSpec, attempts: &[ExecutionAttempt]) -> ExternalProcessError {
    let last = attempts.last();
    ExternalProcessError {
        stage: stage.name.clone(),
        variant: last.map(|a| a.variant_label.clone()).unwrap_or_default(),
        exit_status: last.and_then(|a| a.exit_status),
        detail: last.map(ExecutionAttempt::describe_exit).unwrap_or_default(),
        stderr: last.map(|a| a.stderr.clone()).unwrap_or_default(),
    }
}
