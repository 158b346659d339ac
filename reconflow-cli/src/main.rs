//! Reconflow CLI
//!
//! Runs, plans and inspects reconstruction pipelines:
//! - `run`: execute the pipeline against a workspace, resuming where a
//!   previous run stopped
//! - `plan`: list the stages a run would execute
//! - `visualize`: export a sparse model as a PLY scene
//! - `init-config`: print a configuration file with defaults
//!
//! Exit status is 0 on success, 1 when a stage failed or the run was
//! cancelled, and 2 on configuration or usage errors.

mod args;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reconflow::cancellation::CancellationToken;
use reconflow::events::LoggingEventSink;
use reconflow::geometry::NativeGeometry;
use reconflow::model::{Reconstruction, Scene};
use reconflow::pipeline::{render_plan, PipelineExecutor, RunReport};
use reconflow::reconstruction::build_pipeline;
use reconflow::runner::ProcessRunner;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::args::{Cli, Command, InitConfigArgs, PlanArgs, RunArgs, VisualizeArgs};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log, cli.log_json);

    let outcome = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Plan(args) => plan(&args),
        Command::Visualize(args) => visualize(&args),
        Command::InitConfig(args) => init_config(&args),
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(directive: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let registry = tracing_subscriber::registry().with(filter);
    // stdout carries reports and plans.
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

async fn run(args: RunArgs) -> Result<bool> {
    let config = args.pipeline.resolve()?;
    let graph = build_pipeline(&config, Arc::new(NativeGeometry))?;
    let policy = args.policy.unwrap_or(config.failure_policy);

    let force = match &args.from {
        Some(stage) if !graph.contains(stage) => {
            bail!(
                "unknown stage '{stage}'; stages are: {}",
                graph.execution_order().join(", ")
            )
        }
        Some(stage) => graph.downstream_of(stage),
        None => Default::default(),
    };

    let cancel = CancellationToken::new();
    let executor = PipelineExecutor::new(Arc::new(ProcessRunner::new(cancel.clone())))
        .with_events(Arc::new(LoggingEventSink::default()))
        .with_cancellation(cancel.clone())
        .with_classifier(config.classifier()?)
        .with_working_directory(&config.workspace)
        .with_force(force)
        .with_workspace_lock(!args.no_lock);

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the current stage");
            cancel.cancel("interrupted");
        }
    });

    info!(workspace = %config.workspace.display(), %policy, "Starting reconstruction");
    let report = executor.run(&graph, policy).await;
    interrupt.abort();
    let report = report.context("run aborted before any stage executed")?;

    if let Some(path) = &args.report {
        write_report(&report, path)?;
    }
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(report.success())
}

fn write_report(report: &RunReport, path: &std::path::Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("cannot write report to {}", path.display()))
}

fn plan(args: &PlanArgs) -> Result<bool> {
    let config = args.pipeline.resolve()?;
    let graph = build_pipeline(&config, Arc::new(NativeGeometry))?;
    let entries = PipelineExecutor::new(Arc::new(ProcessRunner::default()))
        .with_working_directory(&config.workspace)
        .plan(&graph);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print!("{}", render_plan(&entries));
    }
    Ok(true)
}

fn visualize(args: &VisualizeArgs) -> Result<bool> {
    let reconstruction = Reconstruction::load(&args.model)
        .with_context(|| format!("cannot load model from {}", args.model.display()))?;
    let scene = Scene::from_reconstruction(&reconstruction, args.frame_size);
    scene.write_ply(&args.output)?;

    info!(
        points = reconstruction.points.len(),
        cameras = reconstruction.images.len(),
        output = %args.output.display(),
        "Scene written"
    );
    Ok(true)
}

fn init_config(args: &InitConfigArgs) -> Result<bool> {
    let json = reconflow::config::PipelineConfig::new(&args.workspace).to_json()?;
    match &args.output {
        Some(path) => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("cannot write {}", path.display()))?;
        }
        None => println!("{json}"),
    }
    Ok(true)
}
