//! Stage specifications.

use crate::artifacts::ArtifactSpec;
use crate::errors::{ErrorInfo, PipelineValidationError};
use crate::runner::FailureClassifier;
use crate::stages::{ParameterVariant, StageAction};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Specification for a single stage in a pipeline.
///
/// Immutable once added to a [`StageGraph`](super::StageGraph).
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// Names of stages that must be satisfied before this one runs.
    pub depends_on: HashSet<String>,
    /// Artifacts that must resolve before the action is invoked.
    pub inputs: Vec<ArtifactSpec>,
    /// Artifacts the stage must produce. Empty means never complete on entry.
    pub outputs: Vec<ArtifactSpec>,
    /// The work to perform.
    pub action: Arc<dyn StageAction>,
    /// Never empty; only [`StageSpec::with_variants`] replaces it.
    variants: Vec<ParameterVariant>,
    /// Kill the action if a single attempt runs longer than this.
    pub timeout: Option<Duration>,
    /// Stage-specific failure classifier; the executor's default is used if unset.
    pub classifier: Option<FailureClassifier>,
    /// Human-readable description.
    pub description: Option<String>,
}

impl StageSpec {
    /// Creates a new stage specification with a single default variant.
    #[must_use]
    pub fn new(name: impl Into<String>, action: Arc<dyn StageAction>) -> Self {
        Self {
            name: name.into(),
            depends_on: HashSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            action,
            variants: vec![ParameterVariant::default()],
            timeout: None,
            classifier: None,
            description: None,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    /// Adds an input artifact.
    #[must_use]
    pub fn with_input(mut self, input: ArtifactSpec) -> Self {
        self.inputs.push(input);
        self
    }

    /// Adds an output artifact.
    #[must_use]
    pub fn with_output(mut self, output: ArtifactSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Replaces the parameter variants. An empty list keeps the single default variant.
    #[must_use]
    pub fn with_variants(mut self, variants: Vec<ParameterVariant>) -> Self {
        if !variants.is_empty() {
            self.variants = variants;
        }
        self
    }

    /// Parameter variants tried in order by the fallback policy. Never empty.
    #[must_use]
    pub fn variants(&self) -> &[ParameterVariant] {
        &self.variants
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets a stage-specific failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns dependencies sorted by name.
    #[must_use]
    pub fn sorted_dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.depends_on.iter().map(String::as_str).collect();
        deps.sort_unstable();
        deps
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the stage depends on itself.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty").with_error_info(
                ErrorInfo::new("GRAPH-EMPTY-NAME", "A stage has an empty name")
                    .with_fix_hint("Give every stage a unique, non-blank name."),
            ));
        }
        if self.depends_on.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(ErrorInfo::new(
                "GRAPH-SELF-DEP",
                format!("Stage '{}' lists itself in depends_on", self.name),
            )));
        }
        Ok(())
    }
}
