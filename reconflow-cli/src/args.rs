//! Command-line arguments.

use clap::{Args, Parser, Subcommand};
use reconflow::config::PipelineConfig;
use reconflow::model::DEFAULT_FRAME_SIZE;
use reconflow::pipeline::FailurePolicy;
use std::path::PathBuf;

/// Resumable 3D reconstruction pipelines.
#[derive(Debug, Parser)]
#[command(name = "reconflow", version, about)]
pub struct Cli {
    /// Log filter directive, e.g. `reconflow=debug`.
    #[arg(long, global = true, env = "RECONFLOW_LOG", default_value = "info")]
    pub log: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "RECONFLOW_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline, skipping stages whose outputs already exist.
    Run(RunArgs),
    /// Show which stages a run would execute, without running anything.
    Plan(PlanArgs),
    /// Export a sparse model's points and camera frames as a PLY scene.
    Visualize(VisualizeArgs),
    /// Print a configuration file with every default filled in.
    InitConfig(InitConfigArgs),
}

/// Options that shape the pipeline.
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// JSON configuration file.
    #[arg(long, short, env = "RECONFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Workspace root; overrides the configuration file.
    #[arg(long, short, env = "RECONFLOW_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Reconstruction engine executable.
    #[arg(long, env = "RECONFLOW_ENGINE")]
    pub engine: Option<PathBuf>,

    /// Use this sparse model index instead of the latest one.
    #[arg(long)]
    pub model_index: Option<u32>,

    /// Enable texture mapping.
    #[arg(long)]
    pub texturing: bool,

    /// Enable meshing of the sparse model's own point cloud.
    #[arg(long)]
    pub sparse_import: bool,
}

impl PipelineArgs {
    /// Loads the configuration file, if any, applies the overrides and
    /// makes the workspace absolute.
    pub fn resolve(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(workspace) = &self.workspace {
            config.workspace.clone_from(workspace);
        }
        if let Some(engine) = &self.engine {
            config.engine_binary.clone_from(engine);
        }
        if self.model_index.is_some() {
            config.model_index = self.model_index;
        }
        config.enable_texturing |= self.texturing;
        config.enable_sparse_import |= self.sparse_import;
        config.validate()?;
        Ok(config.with_absolute_workspace()?)
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Re-run this stage and everything downstream of it.
    #[arg(long)]
    pub from: Option<String>,

    /// Failure policy: `stop` or `continue-independent`.
    #[arg(long)]
    pub policy: Option<FailurePolicy>,

    /// Write the run report as JSON to this file.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Print the run report as JSON instead of text.
    #[arg(long)]
    pub json: bool,

    /// Do not take the workspace lock.
    #[arg(long)]
    pub no_lock: bool,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct VisualizeArgs {
    /// Sparse model directory (`.../reconstruction/<n>`).
    pub model: PathBuf,

    /// Output PLY file.
    #[arg(long, short, default_value = "scene.ply")]
    pub output: PathBuf,

    /// Axis length of the camera frames.
    #[arg(long, default_value_t = DEFAULT_FRAME_SIZE)]
    pub frame_size: f64,
}

#[derive(Debug, Args)]
pub struct InitConfigArgs {
    /// Workspace root recorded in the file.
    #[arg(long, short, default_value = ".")]
    pub workspace: PathBuf,

    /// Write to this file instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "reconflow",
            "run",
            "--workspace",
            "ws",
            "--from",
            "dense_stereo",
            "--policy",
            "continue-independent",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.from.as_deref(), Some("dense_stereo"));
        assert_eq!(args.policy, Some(FailurePolicy::ContinueIndependent));

        let config = args.pipeline.resolve().unwrap();
        assert_eq!(config.workspace, std::env::current_dir().unwrap().join("ws"));
        assert!(config.database_path().is_absolute());
    }

    #[test]
    fn test_config_file_with_overrides() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("reconflow.json");
        std::fs::write(&path, r#"{"workspace": "a", "engine_binary": "/opt/colmap"}"#).unwrap();

        let args = PipelineArgs {
            config: Some(path),
            workspace: Some(PathBuf::from("b")),
            engine: None,
            model_index: Some(3),
            texturing: false,
            sparse_import: true,
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.workspace, std::env::current_dir().unwrap().join("b"));
        assert_eq!(config.engine_binary, PathBuf::from("/opt/colmap"));
        assert_eq!(config.model_index, Some(3));
        assert!(config.enable_sparse_import);
    }

    #[test]
    fn test_config_file_workspace_is_relative_to_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("reconflow.json");
        std::fs::write(&path, r#"{"workspace": "a"}"#).unwrap();

        let args = PipelineArgs {
            config: Some(path),
            workspace: None,
            engine: None,
            model_index: None,
            texturing: false,
            sparse_import: false,
        };
        assert_eq!(args.resolve().unwrap().workspace, tmp.path().join("a"));
    }

    #[test]
    fn test_bad_policy_rejected() {
        assert!(Cli::try_parse_from(["reconflow", "run", "--policy", "sometimes"]).is_err());
    }
}
