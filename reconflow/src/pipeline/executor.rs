//! Sequential, resumable execution of a stage graph.

use super::fallback::{FallbackPolicy, FallbackResult};
use super::{FailurePolicy, PlanEntry, RunReport, StageGraph, StageReport, StageSpec};
use crate::artifacts::{resolve, resolve_all, ResolvedArtifact};
use crate::cancellation::CancellationToken;
use crate::core::StageState;
use crate::errors::{
    OutputVerificationError, ReconflowError, StageFailure, UnsatisfiedDependencyError,
};
use crate::events::{EventSink, NoOpEventSink};
use crate::lock::WorkspaceLock;
use crate::runner::{CommandRunner, FailureClassifier};
use crate::stages::ActionContext;
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs the stages of a [`StageGraph`] one at a time in topological order.
///
/// Progress is never persisted: on every run, a stage whose declared
/// outputs all resolve is reported as already complete and skipped, so
/// re-running against a partially built workspace resumes where the last
/// run stopped.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    runner: Arc<dyn CommandRunner>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    classifier: FailureClassifier,
    working_directory: Option<PathBuf>,
    force: HashSet<String>,
    lock_workspace: bool,
}

impl PipelineExecutor {
    /// Creates an executor that runs external processes through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            events: Arc::new(NoOpEventSink),
            cancel: CancellationToken::new(),
            classifier: FailureClassifier::default(),
            working_directory: None,
            force: HashSet::new(),
            lock_workspace: false,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token. Share it with the runner so that
    /// cancelling also kills the in-flight process.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the classifier used by stages without their own.
    #[must_use]
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the directory external processes run in.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Runs the named stages even if their outputs already resolve.
    #[must_use]
    pub fn with_force(mut self, stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.force = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Holds the workspace lock in the working directory for the whole run.
    #[must_use]
    pub fn with_workspace_lock(mut self, enabled: bool) -> Self {
        self.lock_workspace = enabled;
        self
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs every stage of `graph`.
    ///
    /// Stage failures are recorded in the report, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only if the workspace lock cannot be acquired, in
    /// which case no stage has run.
    pub async fn run(&self, graph: &StageGraph, policy: FailurePolicy) -> Result<RunReport, ReconflowError> {
        let _lock = if self.lock_workspace {
            let dir = self.working_directory.as_deref().unwrap_or_else(|| Path::new("."));
            Some(WorkspaceLock::acquire(dir)?)
        } else {
            None
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline", pipeline = %graph.name(), %run_id);

        let stages = self
            .run_stages(graph, policy, run_id)
            .instrument(span)
            .await;

        let report = RunReport {
            run_id,
            pipeline: graph.name().to_string(),
            started_at,
            ended_at: Utc::now(),
            failure_policy: policy,
            stages,
        };

        self.events
            .emit(
                "pipeline.completed",
                Some(json!({
                    "run_id": run_id,
                    "pipeline": graph.name(),
                    "success": report.success(),
                    "duration_ms": report.duration_ms(),
                })),
            )
            .await;

        Ok(report)
    }

    async fn run_stages(&self, graph: &StageGraph, policy: FailurePolicy, run_id: Uuid) -> Vec<StageReport> {
        info!(stages = graph.stage_count(), policy = %policy, "Pipeline started");
        self.events
            .emit(
                "pipeline.started",
                Some(json!({
                    "run_id": run_id,
                    "pipeline": graph.name(),
                    "order": graph.execution_order(),
                    "failure_policy": policy,
                })),
            )
            .await;

        let mut states: HashMap<String, StageState> = HashMap::new();
        let mut halted: Option<String> = None;
        let mut reports = Vec::with_capacity(graph.stage_count());

        for spec in graph.iter() {
            let report = if let Some(reason) = halted.clone() {
                self.blocked(spec, reason).await
            } else if self.cancel.is_cancelled() {
                let reason = self.cancel.reason().unwrap_or_default();
                halted = Some(format!("run cancelled ({reason})"));
                self.blocked(spec, format!("run cancelled ({reason})")).await
            } else if let Some(reason) = unsatisfied_dependency(spec, &states) {
                self.blocked(spec, reason).await
            } else {
                self.run_stage(spec).await
            };

            match report.state {
                StageState::Failed if policy == FailurePolicy::Stop => {
                    halted = Some(format!("run stopped after stage '{}' failed", spec.name));
                }
                StageState::Cancelled => {
                    halted = Some(format!("run cancelled during stage '{}'", spec.name));
                }
                _ => {}
            }

            states.insert(spec.name.clone(), report.state);
            reports.push(report);
        }

        reports
    }

    async fn blocked(&self, spec: &StageSpec, reason: String) -> StageReport {
        info!(stage = %spec.name, reason = %reason, "Stage blocked");
        self.events
            .emit("stage.blocked", Some(json!({"stage": spec.name, "reason": reason})))
            .await;

        let mut report = StageReport::new(&spec.name, StageState::Blocked);
        report.blocked_reason = Some(reason);
        report
    }

    async fn run_stage(&self, spec: &StageSpec) -> StageReport {
        let forced = self.force.contains(&spec.name);

        if !forced {
            if let Some(outputs) = resolve_outputs(spec) {
                info!(stage = %spec.name, "Outputs present, skipping stage");
                self.events
                    .emit("stage.skipped", Some(json!({"stage": spec.name, "outputs": outputs})))
                    .await;
                let mut report = StageReport::new(&spec.name, StageState::AlreadyComplete);
                report.outputs = outputs;
                return report;
            }
        }

        let inputs = match resolve_all(&spec.inputs) {
            Ok(inputs) => inputs,
            Err((input, e)) => {
                let failure = StageFailure::UnsatisfiedDependency(UnsatisfiedDependencyError {
                    stage: spec.name.clone(),
                    artifact: input.logical_name.clone(),
                    reason: e.to_string(),
                });
                return self.failed(spec, Vec::new(), failure).await;
            }
        };

        info!(stage = %spec.name, forced, variants = spec.variants().len(), "Stage started");
        self.events
            .emit(
                "stage.started",
                Some(json!({"stage": spec.name, "inputs": inputs, "forced": forced})),
            )
            .await;

        let ctx = ActionContext {
            stage: &spec.name,
            inputs: &inputs,
            working_directory: self.working_directory.as_deref(),
            timeout: spec.timeout,
            runner: self.runner.as_ref(),
            cancel: &self.cancel,
        };
        let policy = FallbackPolicy::new(spec.classifier.clone().unwrap_or_else(|| self.classifier.clone()));
        let outcome = policy.run(spec, &ctx).await;

        for attempt in &outcome.attempts {
            self.events.try_emit(
                "attempt.completed",
                Some(json!({
                    "stage": attempt.stage_name,
                    "variant": attempt.variant_label,
                    "outcome": attempt.outcome,
                    "exit_status": attempt.exit_status,
                    "duration_ms": attempt.duration_ms(),
                })),
            );
        }

        match outcome.result {
            FallbackResult::Succeeded { variant_index } => match verify_outputs(spec) {
                Ok(outputs) => {
                    info!(stage = %spec.name, variant = %spec.variants()[variant_index].label, "Stage succeeded");
                    self.events
                        .emit(
                            "stage.completed",
                            Some(json!({"stage": spec.name, "variant": spec.variants()[variant_index].label})),
                        )
                        .await;
                    let mut report = StageReport::new(&spec.name, StageState::Succeeded);
                    report.attempts = outcome.attempts;
                    report.outputs = outputs;
                    report
                }
                Err(failure) => self.failed(spec, outcome.attempts, failure).await,
            },
            FallbackResult::Fatal(e) => {
                self.failed(spec, outcome.attempts, StageFailure::ExternalProcess(e))
                    .await
            }
            FallbackResult::Exhausted(e) => {
                self.failed(spec, outcome.attempts, StageFailure::FallbackExhausted(e))
                    .await
            }
            FallbackResult::Cancelled => {
                warn!(stage = %spec.name, "Stage cancelled");
                self.events
                    .emit("stage.cancelled", Some(json!({"stage": spec.name})))
                    .await;
                let mut report = StageReport::new(&spec.name, StageState::Cancelled);
                report.attempts = outcome.attempts;
                report.failure = Some(StageFailure::Cancelled {
                    stage: spec.name.clone(),
                });
                report
            }
        }
    }

    async fn failed(
        &self,
        spec: &StageSpec,
        attempts: Vec<crate::core::ExecutionAttempt>,
        failure: StageFailure,
    ) -> StageReport {
        warn!(stage = %spec.name, kind = failure.kind(), error = %failure, "Stage failed");
        self.events
            .emit(
                "stage.failed",
                Some(json!({"stage": spec.name, "kind": failure.kind(), "error": failure.to_string()})),
            )
            .await;

        let mut report = StageReport::new(&spec.name, StageState::Failed);
        report.attempts = attempts;
        report.failure = Some(failure);
        report
    }

    /// Lists each stage with its current completion status without running anything.
    #[must_use]
    pub fn plan(&self, graph: &StageGraph) -> Vec<PlanEntry> {
        graph
            .iter()
            .map(|spec| {
                let inputs: Vec<ResolvedArtifact> =
                    spec.inputs.iter().filter_map(|i| resolve(i).ok()).collect();
                PlanEntry {
                    stage: spec.name.clone(),
                    depends_on: spec.sorted_dependencies().into_iter().map(String::from).collect(),
                    complete: resolve_outputs(spec).is_some(),
                    forced: self.force.contains(&spec.name),
                    action: spec
                        .variants()
                        .first()
                        .map(|variant| spec.action.describe(variant, &inputs))
                        .unwrap_or_default(),
                    variants: spec.variants().iter().map(|v| v.label.clone()).collect(),
                }
            })
            .collect()
    }
}

/// Returns the resolved outputs if the stage declares outputs and all resolve.
fn resolve_outputs(spec: &StageSpec) -> Option<Vec<ResolvedArtifact>> {
    if spec.outputs.is_empty() {
        return None;
    }
    resolve_all(&spec.outputs).ok()
}

fn verify_outputs(spec: &StageSpec) -> Result<Vec<ResolvedArtifact>, StageFailure> {
    resolve_all(&spec.outputs).map_err(|(output, e)| {
        StageFailure::OutputVerification(OutputVerificationError {
            stage: spec.name.clone(),
            artifact: output.logical_name.clone(),
            reason: e.to_string(),
        })
    })
}

fn unsatisfied_dependency(spec: &StageSpec, states: &HashMap<String, StageState>) -> Option<String> {
    spec.sorted_dependencies().into_iter().find_map(|dep| {
        let state = states.get(dep).copied().unwrap_or_default();
        (!state.is_satisfied()).then(|| format!("upstream stage '{dep}' is {state}"))
    })
}
