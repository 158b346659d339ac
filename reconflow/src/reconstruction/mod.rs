//! The reconstruction pipeline: engine subcommands and geometry stages
//! wired into a [`StageGraph`].
//!
//! ```text
//! feature_extraction -> feature_matching -> sparse_mapping -> image_undistortion
//!   -> dense_stereo -> stereo_fusion -> normal_fix -> poisson_meshing [-> texture_mapping]
//! sparse_mapping -> sparse_cloud_import -> sparse_normal_fix -> sparse_poisson_meshing
//! ```
//!
//! The last two lines are optional and controlled by [`PipelineConfig`].

mod stages;

pub use stages::names;

use crate::config::PipelineConfig;
use crate::errors::ReconflowError;
use crate::geometry::GeometryLibrary;
use crate::pipeline::{PipelineBuilder, StageGraph};
use std::sync::Arc;

/// Name of the graph built by [`build_pipeline`].
pub const PIPELINE_NAME: &str = "reconstruction";

/// Builds the reconstruction pipeline for a validated configuration.
pub fn build_pipeline(
    config: &PipelineConfig,
    geometry: Arc<dyn GeometryLibrary>,
) -> Result<StageGraph, ReconflowError> {
    config.validate()?;
    let classifier = config.classifier()?;
    let ctx = stages::Context {
        config,
        geometry,
        classifier,
    };

    let mut builder = PipelineBuilder::new(PIPELINE_NAME);
    for spec in stages::dense_chain(&ctx) {
        builder.add_stage(spec)?;
    }
    if config.enable_texturing {
        builder.add_stage(stages::texture_mapping(&ctx))?;
    }
    if config.enable_sparse_import {
        for spec in stages::sparse_import_chain(&ctx) {
            builder.add_stage(spec)?;
        }
    }

    let graph = builder.build()?;
    tracing::debug!(stages = graph.stage_count(), "Built reconstruction pipeline");
    Ok(graph)
}
