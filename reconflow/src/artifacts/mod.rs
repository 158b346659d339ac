//! Artifact specifications and the artifact locator.
//!
//! Artifacts are filesystem paths that evidence a stage's completion. The
//! filesystem is the only record of progress: a stage counts as complete
//! when its declared outputs resolve.

mod locator;
mod spec;

pub use locator::{latest_numbered_subdirectory, require_paths, resolve, resolve_all, staging_path};
pub use spec::{ArtifactSpec, ResolutionRule, ResolvedArtifact};
