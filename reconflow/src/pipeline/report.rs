//! Run reports and dry-run plans.

use super::FailurePolicy;
use crate::artifacts::ResolvedArtifact;
use crate::core::{AttemptOutcome, ExecutionAttempt, StageState};
use crate::errors::StageFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use uuid::Uuid;

/// Outcome of one stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Final state.
    pub state: StageState,
    /// Every invocation of the stage action, in order.
    #[serde(default)]
    pub attempts: Vec<ExecutionAttempt>,
    /// Why the stage failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    /// Why the stage was blocked, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    /// Resolved outputs for satisfied stages.
    #[serde(default)]
    pub outputs: Vec<ResolvedArtifact>,
}

impl StageReport {
    pub(crate) fn new(name: impl Into<String>, state: StageState) -> Self {
        Self {
            name: name.into(),
            state,
            attempts: Vec::new(),
            failure: None,
            blocked_reason: None,
            outputs: Vec::new(),
        }
    }

    fn summary(&self) -> String {
        if let Some(failure) = &self.failure {
            return failure.to_string();
        }
        if let Some(reason) = &self.blocked_reason {
            return reason.clone();
        }
        match self.attempts.last() {
            Some(last) if self.attempts.len() > 1 => {
                format!("variant '{}' after {} attempts", last.variant_label, self.attempts.len())
            }
            _ => String::new(),
        }
    }
}

/// The result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique identifier of the run.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub ended_at: DateTime<Utc>,
    /// Failure policy in effect.
    pub failure_policy: FailurePolicy,
    /// One entry per stage, in execution order.
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Returns true if every stage is satisfied.
    #[must_use]
    pub fn success(&self) -> bool {
        self.stages.iter().all(|s| s.state.is_satisfied())
    }

    /// Looks up a stage report by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the state of a stage.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<StageState> {
        self.stage(name).map(|s| s.state)
    }

    /// Counts stages in `state`.
    #[must_use]
    pub fn count(&self, state: StageState) -> usize {
        self.stages.iter().filter(|s| s.state == state).count()
    }

    /// Returns the wall-clock duration of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Renders a human-readable report.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn render_text(&self) -> String {
        let width = self.stages.iter().map(|s| s.name.len()).max().unwrap_or(0);
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Pipeline '{}' run {} (policy: {}, {:.1}s)",
            self.pipeline,
            self.run_id,
            self.failure_policy,
            self.duration_ms() as f64 / 1000.0
        );

        for stage in &self.stages {
            let summary = stage.summary();
            if summary.is_empty() {
                let _ = writeln!(out, "  {:<width$}  {}", stage.name, stage.state);
            } else {
                let _ = writeln!(out, "  {:<width$}  {:<16}  {}", stage.name, stage.state.to_string(), summary);
            }

            if stage.attempts.len() > 1 || stage.state == StageState::Failed {
                for attempt in &stage.attempts {
                    let result = match attempt.outcome {
                        AttemptOutcome::Succeeded => "ok".to_string(),
                        _ => format!("{} [{}]", attempt.describe_exit(), attempt.outcome),
                    };
                    let _ = writeln!(
                        out,
                        "  {:<width$}    - {}: {} ({} ms)",
                        "",
                        attempt.variant_label,
                        result,
                        attempt.duration_ms()
                    );
                    if attempt.outcome != AttemptOutcome::Succeeded {
                        write_output_tail(&mut out, width, "stderr", &attempt.stderr);
                        if attempt.stderr.trim().is_empty() {
                            write_output_tail(&mut out, width, "stdout", &attempt.stdout);
                        }
                    }
                }
            }
        }

        let verdict = if self.success() { "OK" } else { "FAILED" };
        let _ = writeln!(
            out,
            "Result: {verdict} ({} succeeded, {} already complete, {} failed, {} blocked, {} cancelled)",
            self.count(StageState::Succeeded),
            self.count(StageState::AlreadyComplete),
            self.count(StageState::Failed),
            self.count(StageState::Blocked),
            self.count(StageState::Cancelled),
        );
        out
    }
}

/// Non-empty lines of captured output shown per failed attempt.
const OUTPUT_TAIL_LINES: usize = 8;

fn write_output_tail(out: &mut String, width: usize, stream: &str, text: &str) {
    let lines: Vec<&str> = text.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    if skip > 0 {
        let _ = writeln!(
            out,
            "  {:<width$}      {stream}: ... {skip} earlier lines omitted, full output in the JSON report",
            ""
        );
    }
    for line in &lines[skip..] {
        let _ = writeln!(out, "  {:<width$}      {stream}: {}", "", line.trim_start());
    }
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Stage name.
    pub stage: String,
    /// Direct dependencies, sorted.
    pub depends_on: Vec<String>,
    /// All declared outputs currently resolve.
    pub complete: bool,
    /// The stage is forced to run regardless of its outputs.
    pub forced: bool,
    /// Description of the first variant's invocation.
    pub action: String,
    /// Variant labels in fallback order.
    pub variants: Vec<String>,
}

impl PlanEntry {
    /// Returns true if a run would invoke the stage's action.
    #[must_use]
    pub fn will_run(&self) -> bool {
        self.forced || !self.complete
    }
}

/// Renders a plan as text.
#[must_use]
pub fn render_plan(entries: &[PlanEntry]) -> String {
    let width = entries.iter().map(|e| e.stage.len()).max().unwrap_or(0);
    let mut out = String::new();
    for entry in entries {
        let status = match (entry.complete, entry.forced) {
            (_, true) => "forced",
            (true, false) => "complete",
            (false, false) => "pending",
        };
        let _ = writeln!(out, "{:<width$}  {:<8}  {}", entry.stage, status, entry.action);
        if entry.variants.len() > 1 {
            let _ = writeln!(out, "{:<width$}  {:<8}  fallback: {}", "", "", entry.variants.join(" -> "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FallbackExhaustedError;

    fn attempt(label: &str, outcome: AttemptOutcome, exit_status: i64) -> ExecutionAttempt {
        let now = Utc::now();
        ExecutionAttempt {
            stage_name: "dense_stereo".to_string(),
            variant_index: 0,
            variant_label: label.to_string(),
            started_at: now,
            ended_at: now,
            outcome,
            exit_status: Some(exit_status),
            stdout: String::new(),
            stderr: "Error: CUDA crashed\n\n".to_string(),
            message: None,
        }
    }

    fn report() -> RunReport {
        let now = Utc::now();
        let mut stereo = StageReport::new("dense_stereo", StageState::Failed);
        stereo.attempts = vec![
            attempt("gpu", AttemptOutcome::FailedRetryable, 3_221_226_505),
            attempt("cpu", AttemptOutcome::FailedRetryable, 3_221_226_505),
        ];
        stereo.failure = Some(StageFailure::FallbackExhausted(FallbackExhaustedError {
            stage: "dense_stereo".to_string(),
            attempts: 2,
            last_failure: "exit status 3221226505".to_string(),
        }));

        let mut fusion = StageReport::new("stereo_fusion", StageState::Blocked);
        fusion.blocked_reason = Some("upstream stage 'dense_stereo' is failed".to_string());

        RunReport {
            run_id: Uuid::new_v4(),
            pipeline: "reconstruction".to_string(),
            started_at: now,
            ended_at: now,
            failure_policy: FailurePolicy::Stop,
            stages: vec![StageReport::new("sparse_mapping", StageState::AlreadyComplete), stereo, fusion],
        }
    }

    #[test]
    fn test_report_success_and_counts() {
        let report = report();
        assert!(!report.success());
        assert_eq!(report.count(StageState::Blocked), 1);
        assert_eq!(report.state_of("sparse_mapping"), Some(StageState::AlreadyComplete));
        assert_eq!(report.state_of("nope"), None);
    }

    #[test]
    fn test_render_text_lists_attempts() {
        let text = report().render_text();
        assert!(text.contains("Pipeline 'reconstruction'"));
        assert!(text.contains("- gpu: exit status 3221226505 [failed-retryable]"));
        assert!(text.contains("stderr: Error: CUDA crashed"));
        assert!(text.contains("upstream stage 'dense_stereo' is failed"));
        assert!(text.contains("Result: FAILED"));
    }

    #[test]
    fn test_render_text_shows_output_tail() {
        let mut report = report();
        let log: String = (1..=12).map(|i| format!("line {i}\n")).collect();
        report.stages[1].attempts[1].stderr = log.clone();
        let mut silent = attempt("cpu", AttemptOutcome::FailedFatal, 1);
        silent.stderr = String::new();
        silent.stdout = "Reading workspace...\nF0101 out of memory\n".to_string();
        report.stages[1].attempts.push(silent);

        let text = report.render_text();
        assert!(text.contains("stderr: ... 4 earlier lines omitted, full output in the JSON report"));
        assert!(!text.contains("stderr: line 4\n"));
        assert!(text.contains("stderr: line 5\n"));
        assert!(text.contains("stderr: line 12\n"));
        assert!(text.contains("stdout: Reading workspace..."));
        assert!(text.contains("stdout: F0101 out of memory"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"][1]["attempts"][1]["stderr"], log);
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["failure_policy"], "stop");
        assert_eq!(json["stages"][1]["state"], "failed");
        assert_eq!(json["stages"][1]["failure"]["kind"], "fallback_exhausted");
        assert!(json["stages"][0].get("failure").is_none());
    }

    #[test]
    fn test_render_plan() {
        let entries = vec![
            PlanEntry {
                stage: "sparse_mapping".to_string(),
                depends_on: vec![],
                complete: true,
                forced: false,
                action: "colmap mapper".to_string(),
                variants: vec!["default".to_string()],
            },
            PlanEntry {
                stage: "dense_stereo".to_string(),
                depends_on: vec!["sparse_mapping".to_string()],
                complete: false,
                forced: false,
                action: "colmap patch_match_stereo".to_string(),
                variants: vec!["gpu".to_string(), "cpu".to_string()],
            },
        ];
        assert!(!entries[0].will_run());
        assert!(entries[1].will_run());

        let text = render_plan(&entries);
        assert!(text.contains("complete"));
        assert!(text.contains("fallback: gpu -> cpu"));
    }
}
