//! Error types for the reconflow framework.
//!
//! Structural errors (graph validation, locking, configuration) abort a run
//! before any stage executes. Stage-level errors are captured as
//! [`StageFailure`] values and recorded in the run report instead of being
//! propagated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for reconflow operations.
#[derive(Debug, Error)]
pub enum ReconflowError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The stage graph contains a dependency cycle.
    #[error("{0}")]
    CyclicDependency(#[from] CyclicDependencyError),

    /// A required artifact pattern could not be matched.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// One or more required artifacts are missing.
    #[error("{0}")]
    MissingArtifact(#[from] MissingArtifactError),

    /// The command runner could not run a process.
    #[error("{0}")]
    Runner(#[from] RunnerError),

    /// A geometry collaborator call failed.
    #[error("{0}")]
    Geometry(#[from] GeometryError),

    /// A reconstruction model could not be loaded.
    #[error("{0}")]
    Model(#[from] ModelError),

    /// The configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The workspace is locked by another run.
    #[error("{0}")]
    Lock(#[from] LockError),

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Diagnostic metadata attached to structural errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "GRAPH-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a stage graph fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Error raised when no topological order exists for the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cyclic dependency between stages: {}", cycle_path.join(" -> "))]
pub struct CyclicDependencyError {
    /// The path of stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CyclicDependencyError {
    /// Creates a new cyclic dependency error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-CYCLE",
            format!("Stage graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the depends_on entries in the cycle.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when an artifact locator pattern matches nothing.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("No {what} found in {}", root.display())]
pub struct NotFoundError {
    /// The directory that was searched.
    pub root: PathBuf,
    /// What was being looked for.
    pub what: String,
}

impl NotFoundError {
    /// Creates a new not-found error.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, what: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            what: what.into(),
        }
    }
}

/// Error listing every required path that does not exist.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Missing artifacts: {}", format_paths(missing))]
pub struct MissingArtifactError {
    /// All missing paths, in the order they were requested.
    pub missing: Vec<PathBuf>,
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of any artifact resolution rule.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum LocatorError {
    /// A pattern-based rule matched nothing.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),
    /// One or more fixed paths are missing.
    #[error("{0}")]
    Missing(#[from] MissingArtifactError),
}

impl From<LocatorError> for ReconflowError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::NotFound(e) => Self::NotFound(e),
            LocatorError::Missing(e) => Self::MissingArtifact(e),
        }
    }
}

/// A stage input could not be resolved, so the stage was never attempted.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Stage '{stage}' cannot start: input '{artifact}' is unavailable ({reason})")]
pub struct UnsatisfiedDependencyError {
    /// The stage that could not start.
    pub stage: String,
    /// Logical name of the unresolvable input.
    pub artifact: String,
    /// Locator diagnostic.
    pub reason: String,
}

/// A stage's action succeeded but its declared outputs do not resolve.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Stage '{stage}' reported success but output '{artifact}' failed verification ({reason})")]
pub struct OutputVerificationError {
    /// The stage whose outputs were checked.
    pub stage: String,
    /// Logical name of the failing output.
    pub artifact: String,
    /// Locator diagnostic.
    pub reason: String,
}

/// An external process or collaborator call failed.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Stage '{stage}' variant '{variant}' failed: {detail}")]
pub struct ExternalProcessError {
    /// The stage being executed.
    pub stage: String,
    /// Label of the parameter variant.
    pub variant: String,
    /// Exit status, if the process ran to completion.
    pub exit_status: Option<i64>,
    /// Human-readable description of the failure.
    pub detail: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Every parameter variant of a stage failed with a retryable outcome.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("Stage '{stage}' exhausted all {attempts} parameter variants; last failure: {last_failure}")]
pub struct FallbackExhaustedError {
    /// The stage being executed.
    pub stage: String,
    /// Number of variants attempted.
    pub attempts: usize,
    /// Description of the final failure.
    pub last_failure: String,
}

/// Terminal failure of a single stage, as recorded in the run report.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// An input artifact was missing before start.
    #[error("{0}")]
    UnsatisfiedDependency(UnsatisfiedDependencyError),
    /// Outputs were absent after a nominally successful run.
    #[error("{0}")]
    OutputVerification(OutputVerificationError),
    /// A variant failed with a fatal classification.
    #[error("{0}")]
    ExternalProcess(ExternalProcessError),
    /// All variants failed with retryable classifications.
    #[error("{0}")]
    FallbackExhausted(FallbackExhaustedError),
    /// The stage was interrupted by cancellation.
    #[error("Stage '{stage}' was cancelled")]
    Cancelled {
        /// The interrupted stage.
        stage: String,
    },
}

impl StageFailure {
    /// Returns a short machine-friendly name for the failure class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsatisfiedDependency(_) => "unsatisfied_dependency",
            Self::OutputVerification(_) => "output_verification",
            Self::ExternalProcess(_) => "external_process",
            Self::FallbackExhausted(_) => "fallback_exhausted",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Errors raised by the command runner itself, not by the child process.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The program could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or reading from the child failed.
    #[error("Failed while waiting for '{program}': {source}")]
    Wait {
        /// Program being awaited.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the geometry collaborator.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// IO error while reading or writing a point cloud.
    #[error("Geometry IO error on {}: {source}", path.display())]
    Io {
        /// File being accessed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a PLY file this reader understands.
    #[error("Malformed PLY: {0}")]
    Parse(String),

    /// The PLY encoding or property layout is not supported.
    #[error("Unsupported PLY layout: {0}")]
    Unsupported(String),

    /// The operation needs more points than the cloud holds.
    #[error("Point cloud has {actual} points, at least {required} required")]
    InsufficientPoints {
        /// Points present.
        actual: usize,
        /// Points required.
        required: usize,
    },

    /// Normals were requested but the cloud has none.
    #[error("Point cloud has no normals")]
    MissingNormals,
}

/// Errors raised while loading a sparse reconstruction model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// IO error while reading a model file.
    #[error("Model IO error on {}: {source}", path.display())]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A model file is malformed.
    #[error("{}:{line}: {message}", file.display())]
    Parse {
        /// File being parsed.
        file: PathBuf,
        /// Line (text) or record (binary) number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// Neither the text nor the binary variant of a model file exists.
    #[error("Model directory {} has no {name}.txt or {name}.bin", dir.display())]
    MissingFile {
        /// Model directory.
        dir: PathBuf,
        /// File stem that was looked for.
        name: String,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Cannot read config {}: {source}", path.display())]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A relative workspace could not be made absolute.
    #[error("Cannot resolve workspace {}: {source}", path.display())]
    Workspace {
        /// Workspace as configured.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the schema.
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by the workspace lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another run holds the lock.
    #[error("Workspace is locked by another run ({}): {holder}", path.display())]
    Held {
        /// Lock file path.
        path: PathBuf,
        /// Contents of the lock file.
        holder: String,
    },

    /// The lock file could not be created.
    #[error("Cannot create lock file {}: {source}", path.display())]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}
