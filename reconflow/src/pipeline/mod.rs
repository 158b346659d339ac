//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications and the validating builder
//! - The topologically ordered stage graph
//! - The per-stage fallback policy
//! - The sequential executor, its failure policy and run reports

mod builder;
mod dag;
mod executor;
mod failure_policy;
mod fallback;
mod report;
mod spec;

pub use builder::PipelineBuilder;
pub use dag::StageGraph;
pub use executor::PipelineExecutor;
pub use failure_policy::FailurePolicy;
pub use fallback::{FallbackOutcome, FallbackPolicy, FallbackResult};
pub use report::{render_plan, PlanEntry, RunReport, StageReport};
pub use spec::StageSpec;
