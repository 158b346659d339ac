//! Stage actions: the work a stage performs for one parameter variant.

use super::ParameterVariant;
use crate::artifacts::{staging_path, ResolvedArtifact};
use crate::cancellation::CancellationToken;
use crate::runner::{CommandLine, CommandRunner, ExecutionResult};
use anyhow::Context as _;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt::{self, Debug};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Everything an action needs to run once.
pub struct ActionContext<'a> {
    /// Name of the stage being executed.
    pub stage: &'a str,
    /// Resolved input artifacts, in declaration order.
    pub inputs: &'a [ResolvedArtifact],
    /// Directory external processes run in.
    pub working_directory: Option<&'a Path>,
    /// Per-stage timeout.
    pub timeout: Option<Duration>,
    /// Runner for external processes.
    pub runner: &'a dyn CommandRunner,
    /// Run-wide cancellation token.
    pub cancel: &'a CancellationToken,
}

impl ActionContext<'_> {
    /// Returns the resolved path of the named input.
    #[must_use]
    pub fn input(&self, logical_name: &str) -> Option<&Path> {
        self.inputs
            .iter()
            .find(|a| a.logical_name == logical_name)
            .map(|a| a.path.as_path())
    }
}

impl Debug for ActionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("stage", &self.stage)
            .field("inputs", &self.inputs)
            .field("working_directory", &self.working_directory)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// An action failed without producing an execution result.
///
/// Raised for runner failures (the program could not be started) and for
/// in-process collaborator errors. Always classified as fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    /// Description of the failure.
    pub message: String,
}

impl ActionError {
    /// Creates a new action error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The operation a stage performs.
///
/// External processes and in-process library calls share this interface so
/// the fallback policy can treat them uniformly.
#[async_trait]
pub trait StageAction: Send + Sync + Debug {
    /// Invokes the action once with `variant`.
    async fn invoke(
        &self,
        variant: &ParameterVariant,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecutionResult, ActionError>;

    /// Describes the action for dry-run output.
    fn describe(&self, variant: &ParameterVariant, inputs: &[ResolvedArtifact]) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandArg {
    Flag { key: String, value: String },
    Input { key: String, logical_name: String },
}

/// Runs an engine subcommand through the [`CommandRunner`].
///
/// Arguments are rendered in this order: subcommand, fixed flags and input
/// flags as declared, then the variant's parameters.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: PathBuf,
    subcommand: Option<String>,
    args: Vec<CommandArg>,
    create_dirs: Vec<PathBuf>,
}

impl CommandAction {
    /// Creates an action running `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            subcommand: None,
            args: Vec::new(),
            create_dirs: Vec::new(),
        }
    }

    /// Creates an action running `program subcommand`.
    #[must_use]
    pub fn subcommand(program: impl Into<PathBuf>, subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: Some(subcommand.into()),
            ..Self::new(program)
        }
    }

    /// Adds a fixed `--key value` flag.
    #[must_use]
    pub fn flag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.push(CommandArg::Flag {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    /// Adds a fixed path flag.
    #[must_use]
    pub fn path_flag(self, key: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let value = path.as_ref().to_string_lossy().into_owned();
        self.flag(key, value)
    }

    /// Adds a `--key <path>` flag filled from the named resolved input.
    #[must_use]
    pub fn input_flag(mut self, key: impl Into<String>, logical_name: impl Into<String>) -> Self {
        self.args.push(CommandArg::Input {
            key: key.into(),
            logical_name: logical_name.into(),
        });
        self
    }

    /// Creates `dir` before each invocation; the engine refuses missing output directories.
    #[must_use]
    pub fn creating_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.create_dirs.push(dir.into());
        self
    }

    /// Builds the command line for a variant and set of resolved inputs.
    pub fn command_line(
        &self,
        variant: &ParameterVariant,
        inputs: &[ResolvedArtifact],
    ) -> Result<CommandLine, ActionError> {
        let mut cmd = CommandLine::new(&self.program);
        if let Some(sub) = &self.subcommand {
            cmd = cmd.arg(sub);
        }

        for arg in &self.args {
            cmd = match arg {
                CommandArg::Flag { key, value } => cmd.flag(key, value),
                CommandArg::Input { key, logical_name } => {
                    let input = inputs
                        .iter()
                        .find(|a| &a.logical_name == logical_name)
                        .ok_or_else(|| {
                            ActionError::new(format!("input '{logical_name}' was not resolved"))
                        })?;
                    cmd.flag(key, input.path.display())
                }
            };
        }

        for (key, value) in &variant.params {
            cmd = cmd.flag(key, value);
        }

        Ok(cmd)
    }
}

#[async_trait]
impl StageAction for CommandAction {
    async fn invoke(
        &self,
        variant: &ParameterVariant,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecutionResult, ActionError> {
        let cmd = self.command_line(variant, ctx.inputs)?.with_timeout(ctx.timeout);
        for dir in &self.create_dirs {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ActionError::new(format!("cannot create {}: {e}", dir.display())))?;
        }
        ctx.runner
            .execute(&cmd, ctx.working_directory)
            .await
            .map_err(|e| ActionError::new(e.to_string()))
    }

    fn describe(&self, variant: &ParameterVariant, inputs: &[ResolvedArtifact]) -> String {
        match self.command_line(variant, inputs) {
            Ok(cmd) => cmd.to_string(),
            Err(_) => {
                let sub = self.subcommand.as_deref().unwrap_or_default();
                format!("{} {sub} (inputs unresolved)", self.program.display())
            }
        }
    }
}

type CollaboratorFn = dyn Fn(
        ParameterVariant,
        Vec<ResolvedArtifact>,
        CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<()>>
    + Send
    + Sync;

/// Runs an in-process library call as a stage action.
///
/// The call observes the stage timeout and cancellation token. Async calls
/// are dropped when abandoned. Blocking calls cannot be interrupted and keep
/// running on the blocking pool, so they receive an `abandoned` token that
/// fires on timeout or cancellation; write outputs through
/// [`commit_output`] so that an abandoned call never publishes them.
#[derive(Clone)]
pub struct CollaboratorAction {
    label: String,
    func: Arc<CollaboratorFn>,
}

impl CollaboratorAction {
    /// Wraps an async call.
    pub fn new<F, Fut>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(ParameterVariant, Vec<ResolvedArtifact>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            func: Arc::new(move |variant, inputs, _abandoned: CancellationToken| {
                func(variant, inputs).boxed()
            }),
        }
    }

    /// Wraps a blocking call, run on the blocking thread pool.
    ///
    /// The third argument fires once the stage has given up on the call.
    pub fn blocking<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ParameterVariant, &[ResolvedArtifact], &CancellationToken) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let func = Arc::new(func);
        let call = move |variant: ParameterVariant,
                         inputs: Vec<ResolvedArtifact>,
                         abandoned: CancellationToken| {
            let func = Arc::clone(&func);
            async move {
                match tokio::task::spawn_blocking(move || func(&variant, &inputs, &abandoned)).await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(anyhow::Error::new(e).context("collaborator task panicked")),
                }
            }
            .boxed()
        };
        Self {
            label: label.into(),
            func: Arc::new(call),
        }
    }

    /// Returns the label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Debug for CollaboratorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollaboratorAction")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageAction for CollaboratorAction {
    async fn invoke(
        &self,
        variant: &ParameterVariant,
        ctx: &ActionContext<'_>,
    ) -> Result<ExecutionResult, ActionError> {
        let start = Instant::now();
        let abandoned = CancellationToken::new();
        let call = (self.func)(variant.clone(), ctx.inputs.to_vec(), abandoned.clone());

        let deadline = async {
            match ctx.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            outcome = call => match outcome {
                Ok(()) => Ok(ExecutionResult::in_process_success(start.elapsed())),
                Err(e) => Err(ActionError::new(format!("{}: {e:#}", self.label))),
            },
            () = deadline => {
                abandoned.cancel(format!("{} timed out", self.label));
                Ok(ExecutionResult {
                    duration: start.elapsed(),
                    timed_out: true,
                    ..ExecutionResult::default()
                })
            }
            () = ctx.cancel.cancelled() => {
                abandoned.cancel(format!("{} cancelled", self.label));
                Ok(ExecutionResult {
                    duration: start.elapsed(),
                    cancelled: true,
                    ..ExecutionResult::default()
                })
            }
        }
    }

    fn describe(&self, variant: &ParameterVariant, _inputs: &[ResolvedArtifact]) -> String {
        format!("{} [{variant}]", self.label)
    }
}

/// Produces `target` through its staging path.
///
/// `write` fills the staging file, which is renamed onto `target` only if
/// `write` succeeds and `abandoned` has not fired. Otherwise `target` is left
/// as it was and the staging file is removed.
pub fn commit_output<F>(target: &Path, abandoned: &CancellationToken, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&Path) -> anyhow::Result<()>,
{
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let staging = staging_path(target);
    let committed = write(&staging).and_then(|()| {
        if abandoned.is_cancelled() {
            let reason = abandoned.reason().unwrap_or_else(|| "call abandoned".to_string());
            anyhow::bail!("discarding {}: {reason}", target.display());
        }
        std::fs::rename(&staging, target)
            .with_context(|| format!("cannot move {} into place", target.display()))
    });

    if committed.is_err() && staging.exists() {
        if let Err(e) = std::fs::remove_file(&staging) {
            debug!(path = %staging.display(), error = %e, "Cannot remove staging file");
        }
    }
    committed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RunnerError;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandLine>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn execute(
            &self,
            command: &CommandLine,
            _working_directory: Option<&Path>,
        ) -> Result<ExecutionResult, RunnerError> {
            self.calls.lock().push(command.clone());
            Ok(ExecutionResult::in_process_success(Duration::ZERO))
        }
    }

    fn inputs() -> Vec<ResolvedArtifact> {
        vec![ResolvedArtifact {
            logical_name: "sparse model".to_string(),
            path: PathBuf::from("out/reconstruction/1"),
        }]
    }

    fn ctx<'a>(
        runner: &'a dyn CommandRunner,
        inputs: &'a [ResolvedArtifact],
        cancel: &'a CancellationToken,
    ) -> ActionContext<'a> {
        ActionContext {
            stage: "image_undistortion",
            inputs,
            working_directory: None,
            timeout: Some(Duration::from_secs(5)),
            runner,
            cancel,
        }
    }

    #[test]
    fn test_command_line_rendering() {
        let action = CommandAction::subcommand("colmap", "image_undistorter")
            .path_flag("image_path", "images")
            .input_flag("input_path", "sparse model")
            .flag("output_type", "COLMAP");

        let cmd = action
            .command_line(&ParameterVariant::new("x").with_param("max_image_size", 2000), &inputs())
            .unwrap();

        assert_eq!(
            cmd.args,
            vec![
                "image_undistorter",
                "--image_path",
                "images",
                "--input_path",
                "out/reconstruction/1",
                "--output_type",
                "COLMAP",
                "--max_image_size",
                "2000",
            ]
        );
    }

    #[test]
    fn test_command_line_missing_input() {
        let action = CommandAction::subcommand("colmap", "mapper").input_flag("input_path", "nope");
        let err = action.command_line(&ParameterVariant::default(), &[]).unwrap_err();
        assert!(err.message.contains("nope"));
        assert!(action.describe(&ParameterVariant::default(), &[]).contains("unresolved"));
    }

    #[tokio::test]
    async fn test_command_action_passes_timeout_to_runner() {
        let runner = RecordingRunner::default();
        let cancel = CancellationToken::new();
        let inputs = inputs();
        let action = CommandAction::subcommand("colmap", "mapper").input_flag("input_path", "sparse model");

        let result = action
            .invoke(&ParameterVariant::default(), &ctx(&runner, &inputs, &cancel))
            .await
            .unwrap();

        assert!(result.success());
        let calls = runner.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_command_action_creates_output_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("results").join("reconstruction");
        let runner = RecordingRunner::default();
        let cancel = CancellationToken::new();
        let action = CommandAction::subcommand("colmap", "mapper")
            .path_flag("output_path", &out)
            .creating_dir(&out);

        action
            .invoke(&ParameterVariant::default(), &ctx(&runner, &[], &cancel))
            .await
            .unwrap();
        assert!(out.is_dir());
    }

    #[tokio::test]
    async fn test_collaborator_success_and_failure() {
        let runner = RecordingRunner::default();
        let cancel = CancellationToken::new();
        let inputs = inputs();

        let ok = CollaboratorAction::blocking("fix normals", |_, inputs, _| {
            assert_eq!(inputs.len(), 1);
            Ok(())
        });
        let result = ok
            .invoke(&ParameterVariant::default(), &ctx(&runner, &inputs, &cancel))
            .await
            .unwrap();
        assert!(result.success());

        let failing = CollaboratorAction::blocking("fix normals", |_, _, _| anyhow::bail!("empty cloud"));
        let err = failing
            .invoke(&ParameterVariant::default(), &ctx(&runner, &inputs, &cancel))
            .await
            .unwrap_err();
        assert_eq!(err.message, "fix normals: empty cloud");
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_collaborator_observes_cancellation() {
        let runner = RecordingRunner::default();
        let cancel = CancellationToken::new();
        cancel.cancel("test");

        let slow = CollaboratorAction::new("slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let result = slow
            .invoke(&ParameterVariant::default(), &ctx(&runner, &[], &cancel))
            .await
            .unwrap();
        assert!(result.cancelled);
    }

    #[tokio::test]
    async fn test_timed_out_blocking_call_never_publishes_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("dense").join("fused_fixed.ply");
        let runner = RecordingRunner::default();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let out = target.clone();
        let slow = CollaboratorAction::blocking("fix normals", move |_, _, abandoned| {
            std::thread::sleep(Duration::from_millis(300));
            let committed = commit_output(&out, abandoned, |staging| {
                std::fs::write(staging, b"ply")?;
                Ok(())
            });
            done_tx.send(committed.is_ok()).unwrap();
            committed
        });

        let mut context = ctx(&runner, &[], &cancel);
        context.timeout = Some(Duration::from_millis(50));
        let result = slow.invoke(&ParameterVariant::default(), &context).await.unwrap();
        assert!(result.timed_out);

        let committed = tokio::task::spawn_blocking(move || done_rx.recv().unwrap()).await.unwrap();
        assert!(!committed);
        assert!(!target.exists());
        assert!(!staging_path(&target).exists());
    }

    #[test]
    fn test_commit_output_publishes_only_complete_writes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("rec.ply");
        let live = CancellationToken::new();

        let err = commit_output(&target, &live, |staging| {
            std::fs::write(staging, b"half")?;
            anyhow::bail!("disk full")
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(!target.exists());
        assert!(!staging_path(&target).exists());

        commit_output(&target, &live, |staging| Ok(std::fs::write(staging, b"whole")?)).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"whole");

        let abandoned = CancellationToken::new();
        abandoned.cancel("timed out");
        let err = commit_output(&target, &abandoned, |staging| Ok(std::fs::write(staging, b"late")?))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(std::fs::read(&target).unwrap(), b"whole");
    }
}
