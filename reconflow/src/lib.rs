//! # Reconflow
//!
//! Resumable staged pipelines for 3D reconstruction tooling.
//!
//! Reconflow drives an external reconstruction engine (a COLMAP-compatible
//! command line) and an in-process geometry library through a pipeline of
//! named stages, with support for:
//!
//! - **Dependency-aware sequencing**: stages run in topological order; cycles
//!   are rejected before anything executes
//! - **Idempotent resume**: a stage whose declared output artifacts already
//!   exist is skipped, so re-running a workspace continues where it stopped
//! - **Structured fallback**: ordered parameter variants (GPU, then CPU) with
//!   retryable/fatal classification of failures
//! - **Artifact verification**: outputs are checked after every stage
//! - **Cancellation**: an interrupted run kills the child process it waits on
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reconflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::load("reconflow.json".as_ref())?;
//! let graph = build_pipeline(&config, Arc::new(NativeGeometry))?;
//!
//! let executor = PipelineExecutor::new(Arc::new(ProcessRunner::default()))
//!     .with_working_directory(&config.workspace);
//! let report = executor.run(&graph, config.failure_policy).await?;
//! println!("{}", report.render_text());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod geometry;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod reconstruction;
pub mod runner;
pub mod stages;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{ArtifactSpec, ResolutionRule, ResolvedArtifact};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::core::{AttemptOutcome, ExecutionAttempt, StageState};
    pub use crate::errors::{
        CyclicDependencyError, ExternalProcessError, FallbackExhaustedError,
        MissingArtifactError, NotFoundError, OutputVerificationError,
        PipelineValidationError, ReconflowError, StageFailure,
        UnsatisfiedDependencyError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::geometry::{GeometryLibrary, NativeGeometry, PointCloud};
    pub use crate::model::{Reconstruction, Scene};
    pub use crate::pipeline::{
        FailurePolicy, PipelineBuilder, PipelineExecutor, RunReport, StageGraph, StageSpec,
    };
    pub use crate::reconstruction::build_pipeline;
    pub use crate::runner::{CommandLine, CommandRunner, ExecutionResult, FailureClassifier, ProcessRunner};
    pub use crate::stages::{CollaboratorAction, CommandAction, ParameterVariant, StageAction};
}
