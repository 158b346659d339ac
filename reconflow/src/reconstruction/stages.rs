//! Stage definitions for the reconstruction pipeline.

use crate::artifacts::{ArtifactSpec, ResolvedArtifact};
use crate::config::PipelineConfig;
use crate::geometry::{self, GeometryLibrary};
use crate::pipeline::StageSpec;
use crate::runner::FailureClassifier;
use crate::stages::{commit_output, CollaboratorAction, CommandAction, ParameterVariant};
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stage names.
pub mod names {
    /// `feature_extractor`
    pub const FEATURE_EXTRACTION: &str = "feature_extraction";
    /// `exhaustive_matcher`
    pub const FEATURE_MATCHING: &str = "feature_matching";
    /// `mapper`
    pub const SPARSE_MAPPING: &str = "sparse_mapping";
    /// `image_undistorter`
    pub const IMAGE_UNDISTORTION: &str = "image_undistortion";
    /// `patch_match_stereo`, GPU first then CPU.
    pub const DENSE_STEREO: &str = "dense_stereo";
    /// `stereo_fusion`
    pub const STEREO_FUSION: &str = "stereo_fusion";
    /// Normal re-estimation of the fused cloud.
    pub const NORMAL_FIX: &str = "normal_fix";
    /// `poisson_mesher`
    pub const POISSON_MESHING: &str = "poisson_meshing";
    /// `texture_mapper`
    pub const TEXTURE_MAPPING: &str = "texture_mapping";
    /// Copy of the sparse model's `rec.ply`.
    pub const SPARSE_CLOUD_IMPORT: &str = "sparse_cloud_import";
    /// Normal re-estimation of the imported cloud.
    pub const SPARSE_NORMAL_FIX: &str = "sparse_normal_fix";
    /// `poisson_mesher` on the imported cloud.
    pub const SPARSE_POISSON_MESHING: &str = "sparse_poisson_meshing";
}

use names::*;

const IMAGES: &str = "images";
const DATABASE: &str = "database";
const SPARSE_MODEL: &str = "sparse model";
const DENSE_WORKSPACE: &str = "dense workspace";
const DEPTH_MAPS: &str = "depth maps";
const FUSED_CLOUD: &str = "fused cloud";
const ORIENTED_CLOUD: &str = "oriented cloud";
const MESH: &str = "mesh";
const SPARSE_CLOUD: &str = "sparse cloud";

/// File the mapper may leave next to a sparse model.
pub const SPARSE_CLOUD_FILE: &str = "rec.ply";
const FIXED_CLOUD_FILE: &str = "fused_fixed.ply";
const MESH_FILE: &str = "meshed-poisson.ply";

pub(super) struct Context<'a> {
    pub config: &'a PipelineConfig,
    pub geometry: Arc<dyn GeometryLibrary>,
    pub classifier: FailureClassifier,
}

impl Context<'_> {
    fn engine(&self, subcommand: &str) -> CommandAction {
        CommandAction::subcommand(&self.config.engine_binary, subcommand)
    }

    fn stage(&self, name: &str, action: impl crate::stages::StageAction + 'static) -> StageSpec {
        StageSpec::new(name, Arc::new(action))
            .with_timeout(self.config.timeout_for(name))
            .with_classifier(self.classifier.clone())
    }

    fn sparse_model(&self) -> ArtifactSpec {
        let root = self.config.sparse_dir();
        match self.config.model_index {
            Some(index) => ArtifactSpec::fixed(SPARSE_MODEL, root.join(index.to_string())),
            None => ArtifactSpec::latest_numbered(SPARSE_MODEL, root),
        }
    }

    fn images(&self) -> ArtifactSpec {
        ArtifactSpec::fixed(IMAGES, self.config.images_dir())
    }

    fn database(&self) -> ArtifactSpec {
        ArtifactSpec::fixed(DATABASE, self.config.database_path())
    }

    fn dense_workspace(&self) -> ArtifactSpec {
        ArtifactSpec::required_set(
            DENSE_WORKSPACE,
            self.config.dense_dir(),
            ["images", "sparse", "stereo"],
        )
    }
}

fn input<'a>(inputs: &'a [ResolvedArtifact], name: &str) -> anyhow::Result<&'a Path> {
    inputs
        .iter()
        .find(|a| a.logical_name == name)
        .map(ResolvedArtifact::path)
        .with_context(|| format!("input '{name}' was not resolved"))
}

/// Extraction, matching, mapping, undistortion, stereo, fusion, normals, meshing.
pub(super) fn dense_chain(ctx: &Context<'_>) -> Vec<StageSpec> {
    let config = ctx.config;
    let dense = config.dense_dir();
    let fused = dense.join("fused.ply");

    let feature_extraction = ctx
        .stage(
            FEATURE_EXTRACTION,
            ctx.engine("feature_extractor")
                .path_flag("database_path", config.database_path())
                .path_flag("image_path", config.images_dir()),
        )
        .with_input(ctx.images())
        .with_output(ctx.database())
        .with_description("Detect keypoints in every image");

    // Matches live inside the database, so there is no artifact to check;
    // the engine skips image pairs that are already matched.
    let feature_matching = ctx
        .stage(
            FEATURE_MATCHING,
            ctx.engine("exhaustive_matcher").path_flag("database_path", config.database_path()),
        )
        .with_dependency(FEATURE_EXTRACTION)
        .with_input(ctx.database())
        .with_description("Match features between all image pairs");

    let sparse_mapping = ctx
        .stage(
            SPARSE_MAPPING,
            ctx.engine("mapper")
                .path_flag("database_path", config.database_path())
                .path_flag("image_path", config.images_dir())
                .path_flag("output_path", config.sparse_dir())
                .creating_dir(config.sparse_dir()),
        )
        .with_dependency(FEATURE_MATCHING)
        .with_input(ctx.database())
        .with_input(ctx.images())
        .with_output(ctx.sparse_model())
        .with_description("Incremental structure-from-motion");

    let image_undistortion = ctx
        .stage(
            IMAGE_UNDISTORTION,
            ctx.engine("image_undistorter")
                .path_flag("image_path", config.images_dir())
                .input_flag("input_path", SPARSE_MODEL)
                .path_flag("output_path", &dense)
                .flag("output_type", "COLMAP"),
        )
        .with_dependency(SPARSE_MAPPING)
        .with_input(ctx.sparse_model())
        .with_input(ctx.images())
        .with_output(ctx.dense_workspace())
        .with_description("Undistort images into the dense workspace");

    let dense_stereo = ctx
        .stage(
            DENSE_STEREO,
            ctx.engine("patch_match_stereo")
                .path_flag("workspace_path", &dense)
                .flag("workspace_format", "COLMAP")
                .flag("PatchMatchStereo.geom_consistency", config.stereo.geom_consistency),
        )
        .with_dependency(IMAGE_UNDISTORTION)
        .with_input(ctx.dense_workspace())
        .with_output(ArtifactSpec::non_empty_directory(
            DEPTH_MAPS,
            dense.join("stereo").join("depth_maps"),
        ))
        .with_variants(stereo_variants(config))
        .with_description("Patch-match depth estimation");

    let stereo_fusion = ctx
        .stage(
            STEREO_FUSION,
            ctx.engine("stereo_fusion")
                .path_flag("workspace_path", &dense)
                .flag("workspace_format", "COLMAP")
                .flag("input_type", "geometric")
                .path_flag("output_path", &fused),
        )
        .with_dependency(DENSE_STEREO)
        .with_input(ctx.dense_workspace())
        .with_output(ArtifactSpec::fixed(FUSED_CLOUD, &fused))
        .with_description("Fuse depth maps into a point cloud");

    let normal_fix = normal_fix_stage(ctx, NORMAL_FIX, FUSED_CLOUD, dense.join(FIXED_CLOUD_FILE))
        .with_dependency(STEREO_FUSION)
        .with_input(ArtifactSpec::fixed(FUSED_CLOUD, &fused));

    let poisson_meshing = poisson_stage(ctx, POISSON_MESHING, &dense).with_dependency(NORMAL_FIX);

    vec![
        feature_extraction,
        feature_matching,
        sparse_mapping,
        image_undistortion,
        dense_stereo,
        stereo_fusion,
        normal_fix,
        poisson_meshing,
    ]
}

/// Texture mapping of the Poisson mesh.
pub(super) fn texture_mapping(ctx: &Context<'_>) -> StageSpec {
    let dense = ctx.config.dense_dir();
    let mesh = dense.join(MESH_FILE);
    let textured = dense.join("textured.obj");

    ctx.stage(
        TEXTURE_MAPPING,
        ctx.engine("texture_mapper")
            .input_flag("input_path", MESH)
            .path_flag("image_path", dense.join("images"))
            .path_flag("output_path", &textured),
    )
    .with_dependency(POISSON_MESHING)
    .with_input(ArtifactSpec::fixed(MESH, mesh))
    .with_input(ctx.dense_workspace())
    .with_output(ArtifactSpec::fixed("textured mesh", textured))
    .with_description("Project image colours onto the mesh")
}

/// Meshing of the sparse model's own point cloud in `<results>/dense_ee`.
pub(super) fn sparse_import_chain(ctx: &Context<'_>) -> Vec<StageSpec> {
    let target_dir = ctx.config.dense_ee_dir();
    let imported = target_dir.join(SPARSE_CLOUD_FILE);

    let copy_to = imported.clone();
    let import = ctx
        .stage(
            SPARSE_CLOUD_IMPORT,
            CollaboratorAction::blocking("import sparse cloud", move |_, inputs, abandoned| {
                let source = input(inputs, SPARSE_MODEL)?.join(SPARSE_CLOUD_FILE);
                commit_output(&copy_to, abandoned, |staging| {
                    std::fs::copy(&source, staging).with_context(|| {
                        format!("cannot copy {} to {}", source.display(), staging.display())
                    })?;
                    Ok(())
                })?;
                tracing::info!(from = %source.display(), to = %copy_to.display(), "Imported sparse cloud");
                Ok(())
            }),
        )
        .with_dependency(SPARSE_MAPPING)
        .with_input(ctx.sparse_model())
        .with_output(ArtifactSpec::fixed(SPARSE_CLOUD, &imported))
        .with_description(format!("Copy the sparse model's {SPARSE_CLOUD_FILE}"));

    let normal_fix = normal_fix_stage(ctx, SPARSE_NORMAL_FIX, SPARSE_CLOUD, target_dir.join(FIXED_CLOUD_FILE))
        .with_dependency(SPARSE_CLOUD_IMPORT)
        .with_input(ArtifactSpec::fixed(SPARSE_CLOUD, &imported));

    let meshing = poisson_stage(ctx, SPARSE_POISSON_MESHING, &target_dir).with_dependency(SPARSE_NORMAL_FIX);

    vec![import, normal_fix, meshing]
}

/// One variant per configured stereo setting.
pub(super) fn stereo_variants(config: &PipelineConfig) -> Vec<ParameterVariant> {
    config
        .stereo
        .variants
        .iter()
        .map(|v| {
            let variant = ParameterVariant::new(&v.label)
                .with_param("PatchMatchStereo.max_image_size", v.max_image_size);
            match v.gpu_index {
                Some(gpu) => variant.with_param("PatchMatchStereo.gpu_index", gpu),
                None => variant,
            }
        })
        .collect()
}

fn normal_fix_stage(ctx: &Context<'_>, name: &str, input_name: &'static str, output: PathBuf) -> StageSpec {
    let library = Arc::clone(&ctx.geometry);
    let normals = ctx.config.normals;
    let target = output.clone();

    ctx.stage(
        name,
        CollaboratorAction::blocking("fix normals", move |_, inputs, abandoned| {
            let source = input(inputs, input_name)?;
            commit_output(&target, abandoned, |staging| {
                geometry::fix_normals(
                    library.as_ref(),
                    source,
                    staging,
                    normals.estimate_neighbors,
                    normals.orient_neighbors,
                )?;
                Ok(())
            })
        }),
    )
    .with_output(ArtifactSpec::fixed(ORIENTED_CLOUD, output))
    .with_description("Re-estimate and orient point normals")
}

fn poisson_stage(ctx: &Context<'_>, name: &str, dir: &Path) -> StageSpec {
    let poisson = ctx.config.poisson;
    let mesh = dir.join(MESH_FILE);

    ctx.stage(
        name,
        ctx.engine("poisson_mesher")
            .input_flag("input_path", ORIENTED_CLOUD)
            .path_flag("output_path", &mesh)
            .flag("PoissonMeshing.depth", poisson.depth)
            .flag("PoissonMeshing.trim", poisson.trim),
    )
    .with_input(ArtifactSpec::fixed(ORIENTED_CLOUD, dir.join(FIXED_CLOUD_FILE)))
    .with_output(ArtifactSpec::fixed(MESH, mesh))
    .with_description("Screened Poisson surface reconstruction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MockGeometryLibrary;
    use crate::reconstruction::build_pipeline;
    use pretty_assertions::assert_eq;

    fn build(config: &PipelineConfig) -> crate::pipeline::StageGraph {
        build_pipeline(config, Arc::new(MockGeometryLibrary::new())).unwrap()
    }

    #[test]
    fn test_default_pipeline_order() {
        let graph = build(&PipelineConfig::new("ws"));
        assert_eq!(
            graph.execution_order(),
            vec![
                FEATURE_EXTRACTION,
                FEATURE_MATCHING,
                SPARSE_MAPPING,
                IMAGE_UNDISTORTION,
                DENSE_STEREO,
                STEREO_FUSION,
                NORMAL_FIX,
                POISSON_MESHING,
            ]
        );
    }

    #[test]
    fn test_optional_branches() {
        let config = PipelineConfig::new("ws").with_texturing(true).with_sparse_import(true);
        let graph = build(&config);

        assert_eq!(graph.stage_count(), 12);
        assert!(graph.contains(TEXTURE_MAPPING));
        let deps = graph.transitive_dependencies(SPARSE_POISSON_MESHING);
        assert!(deps.contains(SPARSE_MAPPING));
        assert!(!deps.contains(DENSE_STEREO));
    }

    #[test]
    fn test_stereo_variants_from_config() {
        let variants = stereo_variants(&PipelineConfig::default());
        let rendered: Vec<String> = variants.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "gpu (PatchMatchStereo.gpu_index=0, PatchMatchStereo.max_image_size=2400)",
                "cpu (PatchMatchStereo.gpu_index=-1, PatchMatchStereo.max_image_size=2000)",
            ]
        );
    }

    #[test]
    fn test_pinned_model_index_is_a_fixed_path() {
        let config = PipelineConfig::new("ws").with_model_index(Some(2));
        let graph = build(&config);

        let undistort = graph.stage(IMAGE_UNDISTORTION).unwrap();
        let model = &undistort.inputs[0];
        assert_eq!(model.logical_name, SPARSE_MODEL);
        assert_eq!(
            model.rule,
            crate::artifacts::ResolutionRule::Fixed {
                path: PathBuf::from("ws/results/reconstruction/2")
            }
        );
    }

    #[test]
    fn test_poisson_command_line() {
        let graph = build(&PipelineConfig::new("ws"));
        let stage = graph.stage(POISSON_MESHING).unwrap();
        let inputs = vec![ResolvedArtifact {
            logical_name: ORIENTED_CLOUD.to_string(),
            path: PathBuf::from("ws/dense/fused_fixed.ply"),
        }];

        let described = stage.action.describe(&stage.variants()[0], &inputs);
        assert_eq!(
            described,
            "colmap poisson_mesher --input_path ws/dense/fused_fixed.ply \
             --output_path ws/dense/meshed-poisson.ply --PoissonMeshing.depth 13 --PoissonMeshing.trim 5"
        );
    }

    #[test]
    fn test_timeouts_and_classifier_applied() {
        let mut config = PipelineConfig::new("ws").with_timeout(DENSE_STEREO, 3600.0);
        config.retry.exit_codes.push(137);
        let graph = build(&config);

        let stereo = graph.stage(DENSE_STEREO).unwrap();
        assert_eq!(stereo.timeout, Some(std::time::Duration::from_secs(3600)));
        assert_eq!(stereo.classifier.as_ref().unwrap().signatures().len(), 2);
        assert_eq!(graph.stage(STEREO_FUSION).unwrap().timeout, None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::new("ws");
        config.stereo.variants.clear();
        let err = build_pipeline(&config, Arc::new(MockGeometryLibrary::new())).unwrap_err();
        assert!(matches!(err, crate::errors::ReconflowError::Config(_)));
    }
}
