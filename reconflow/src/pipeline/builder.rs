//! Pipeline builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{ErrorInfo, PipelineValidationError, ReconflowError};
use std::collections::HashSet;

/// Collects stage specifications and validates them into a [`StageGraph`].
///
/// Stages may reference dependencies declared later; references are
/// checked in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageSpec>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its name is
    /// already taken.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        self.add_stage(spec)?;
        Ok(self)
    }

    /// Adds a stage in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its name is
    /// already taken.
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if self.stages.iter().any(|s| s.name == spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is declared more than once",
                spec.name
            ))
            .with_stages(vec![spec.name.clone()])
            .with_error_info(
                ErrorInfo::new("GRAPH-DUPLICATE", format!("Duplicate stage name '{}'", spec.name))
                    .with_fix_hint("Stage names must be unique within a pipeline."),
            ));
        }

        self.stages.push(spec);
        Ok(())
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the stages and orders them.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty pipeline or an unknown
    /// dependency, and a cyclic dependency error if no order exists.
    pub fn build(self) -> Result<StageGraph, ReconflowError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    ErrorInfo::new("GRAPH-EMPTY", "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage before building."),
                )
                .into());
        }

        let known: HashSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for spec in &self.stages {
            if let Some(dep) = spec.sorted_dependencies().into_iter().find(|d| !known.contains(d)) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    spec.name, dep
                ))
                .with_stages(vec![spec.name.clone(), dep.to_string()])
                .with_error_info(
                    ErrorInfo::new("GRAPH-MISSING-DEP", format!("Dependency '{dep}' not found"))
                        .with_context_entry("stage", spec.name.clone())
                        .with_fix_hint("Declare the dependency as a stage or remove it from depends_on."),
                )
                .into());
            }
        }

        Ok(StageGraph::new(self.name, self.stages)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::CommandAction;
    use std::sync::Arc;

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name, Arc::new(CommandAction::subcommand("engine", name)))
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_builder_forward_references() {
        let graph = PipelineBuilder::new("test")
            .stage(stage("b", &["a"]))
            .unwrap()
            .stage(stage("a", &[]))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.name(), "test");
        assert_eq!(graph.execution_order(), vec!["a", "b"]);
    }

    #[test]
    fn test_builder_duplicate_name() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a", &[]))
            .unwrap()
            .stage(stage("a", &[]))
            .unwrap_err();
        assert_eq!(err.error_info.unwrap().code, "GRAPH-DUPLICATE");
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a", &["missing"]))
            .unwrap()
            .build()
            .unwrap_err();

        match err {
            ReconflowError::Validation(e) => {
                assert_eq!(e.stages, vec!["a".to_string(), "missing".to_string()]);
                assert_eq!(e.error_info.unwrap().code, "GRAPH-MISSING-DEP");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a", &["b"]))
            .unwrap()
            .stage(stage("b", &["a"]))
            .unwrap()
            .build()
            .unwrap_err();

        match err {
            ReconflowError::CyclicDependency(e) => {
                assert_eq!(e.cycle_path, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("test").build().unwrap_err();
        assert!(matches!(err, ReconflowError::Validation(_)));
    }
}
