//! Pipeline configuration.
//!
//! Every tunable of the reconstruction pipeline lives in one explicit
//! [`PipelineConfig`] record, loaded from JSON and validated before any
//! stage is built.

use crate::errors::ConfigError;
use crate::pipeline::FailurePolicy;
use crate::runner::{FailureClassifier, FailureSignature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration of a reconstruction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Workspace root containing `images/`.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Reconstruction engine executable.
    #[serde(default = "default_engine_binary")]
    pub engine_binary: PathBuf,
    /// Name of the results directory under the workspace.
    #[serde(default = "default_results_name")]
    pub results_name: String,
    /// What to do after a stage fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Use this sparse model index instead of the latest one.
    #[serde(default)]
    pub model_index: Option<u32>,
    /// Dense stereo settings.
    #[serde(default)]
    pub stereo: StereoConfig,
    /// Poisson meshing settings.
    #[serde(default)]
    pub poisson: PoissonConfig,
    /// Normal estimation settings.
    #[serde(default)]
    pub normals: NormalsConfig,
    /// Failure classification settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-stage timeouts in seconds, keyed by stage name.
    #[serde(default)]
    pub timeouts: BTreeMap<String, f64>,
    /// Run texture mapping after meshing.
    #[serde(default)]
    pub enable_texturing: bool,
    /// Mesh the sparse model's `rec.ply` in `<results>/dense_ee`.
    #[serde(default)]
    pub enable_sparse_import: bool,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("colmap")
}

fn default_results_name() -> String {
    "results".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            engine_binary: default_engine_binary(),
            results_name: default_results_name(),
            failure_policy: FailurePolicy::default(),
            model_index: None,
            stereo: StereoConfig::default(),
            poisson: PoissonConfig::default(),
            normals: NormalsConfig::default(),
            retry: RetryConfig::default(),
            timeouts: BTreeMap::new(),
            enable_texturing: false,
            enable_sparse_import: false,
        }
    }
}

/// One dense stereo parameter variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StereoVariant {
    /// Label in logs and reports.
    pub label: String,
    /// GPU index; `-1` selects the CPU, `None` leaves the engine default.
    #[serde(default)]
    pub gpu_index: Option<i32>,
    /// Maximum image dimension.
    pub max_image_size: u32,
}

/// Dense stereo settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StereoConfig {
    /// Variants tried in order.
    #[serde(default = "default_stereo_variants")]
    pub variants: Vec<StereoVariant>,
    /// Enable geometric consistency.
    #[serde(default = "default_true")]
    pub geom_consistency: bool,
}

fn default_stereo_variants() -> Vec<StereoVariant> {
    vec![
        StereoVariant {
            label: "gpu".to_string(),
            gpu_index: Some(0),
            max_image_size: 2400,
        },
        StereoVariant {
            label: "cpu".to_string(),
            gpu_index: Some(-1),
            max_image_size: 2000,
        },
    ]
}

fn default_true() -> bool {
    true
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            variants: default_stereo_variants(),
            geom_consistency: true,
        }
    }
}

/// Poisson meshing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoissonConfig {
    /// Octree depth.
    #[serde(default = "default_poisson_depth")]
    pub depth: u32,
    /// Trim value.
    #[serde(default = "default_poisson_trim")]
    pub trim: u32,
}

fn default_poisson_depth() -> u32 {
    13
}

fn default_poisson_trim() -> u32 {
    5
}

impl Default for PoissonConfig {
    fn default() -> Self {
        Self {
            depth: default_poisson_depth(),
            trim: default_poisson_trim(),
        }
    }
}

/// Normal estimation and orientation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalsConfig {
    /// Neighbours used to fit each local plane.
    #[serde(default = "default_neighbors")]
    pub estimate_neighbors: usize,
    /// Neighbourhood size of the orientation graph.
    #[serde(default = "default_neighbors")]
    pub orient_neighbors: usize,
}

fn default_neighbors() -> usize {
    30
}

impl Default for NormalsConfig {
    fn default() -> Self {
        Self {
            estimate_neighbors: default_neighbors(),
            orient_neighbors: default_neighbors(),
        }
    }
}

/// Extra transient-failure signatures on top of the built-in stack overrun.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Exit codes that allow falling back to the next variant.
    #[serde(default)]
    pub exit_codes: Vec<u32>,
    /// Regular expressions matched against stderr.
    #[serde(default)]
    pub stderr_patterns: Vec<String>,
    /// Treat a timed-out attempt as retryable.
    #[serde(default)]
    pub retry_on_timeout: bool,
}

impl PipelineConfig {
    /// Creates a configuration with defaults for `workspace`.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// Loads and validates a JSON configuration file.
    ///
    /// A relative workspace is taken relative to the directory holding the
    /// file, then made absolute.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        match path.parent() {
            Some(dir) => config.anchored_at(dir).with_absolute_workspace(),
            None => config.with_absolute_workspace(),
        }
    }

    /// Joins a relative workspace onto `base`. Absolute workspaces are kept.
    #[must_use]
    pub fn anchored_at(mut self, base: &Path) -> Self {
        if self.workspace.is_relative() {
            self.workspace = base.join(&self.workspace);
        }
        self
    }

    /// Makes the workspace absolute against the current directory.
    ///
    /// Engine commands receive workspace paths as flags and may run with a
    /// different working directory, so every derived path must be absolute.
    pub fn with_absolute_workspace(self) -> Result<Self, ConfigError> {
        if self.workspace.is_absolute() {
            return Ok(self);
        }
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Workspace {
            path: self.workspace.clone(),
            source,
        })?;
        Ok(self.anchored_at(&cwd))
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration as pretty JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sets the engine binary.
    #[must_use]
    pub fn with_engine_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.engine_binary = binary.into();
        self
    }

    /// Sets the results directory name.
    #[must_use]
    pub fn with_results_name(mut self, name: impl Into<String>) -> Self {
        self.results_name = name.into();
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Pins the sparse model index.
    #[must_use]
    pub fn with_model_index(mut self, index: Option<u32>) -> Self {
        self.model_index = index;
        self
    }

    /// Enables or disables texture mapping.
    #[must_use]
    pub fn with_texturing(mut self, enabled: bool) -> Self {
        self.enable_texturing = enabled;
        self
    }

    /// Enables or disables the sparse-cloud import branch.
    #[must_use]
    pub fn with_sparse_import(mut self, enabled: bool) -> Self {
        self.enable_sparse_import = enabled;
        self
    }

    /// Sets a stage timeout.
    #[must_use]
    pub fn with_timeout(mut self, stage: impl Into<String>, seconds: f64) -> Self {
        self.timeouts.insert(stage.into(), seconds);
        self
    }

    /// Checks value ranges and compiles the stderr patterns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.results_name.trim().is_empty() {
            return invalid("results_name cannot be empty".to_string());
        }
        if Path::new(&self.results_name).components().count() != 1 {
            return invalid(format!(
                "results_name '{}' must be a single directory name",
                self.results_name
            ));
        }
        if self.engine_binary.as_os_str().is_empty() {
            return invalid("engine_binary cannot be empty".to_string());
        }
        if self.stereo.variants.is_empty() {
            return invalid("stereo.variants must list at least one variant".to_string());
        }
        for variant in &self.stereo.variants {
            if variant.max_image_size == 0 {
                return invalid(format!("stereo variant '{}' has max_image_size 0", variant.label));
            }
            if variant.gpu_index.is_some_and(|g| g < -1) {
                return invalid(format!(
                    "stereo variant '{}' has gpu_index below -1",
                    variant.label
                ));
            }
        }
        if !(1..=20).contains(&self.poisson.depth) {
            return invalid(format!("poisson.depth {} is outside 1..=20", self.poisson.depth));
        }
        if self.normals.estimate_neighbors < 3 || self.normals.orient_neighbors < 1 {
            return invalid(
                "normals.estimate_neighbors must be at least 3 and orient_neighbors at least 1"
                    .to_string(),
            );
        }
        for (stage, seconds) in &self.timeouts {
            if !seconds.is_finite() || *seconds <= 0.0 {
                return invalid(format!("timeout for '{stage}' must be a positive number of seconds"));
            }
        }
        self.classifier().map(|_| ())
    }

    /// Builds the failure classifier described by `retry`.
    pub fn classifier(&self) -> Result<FailureClassifier, ConfigError> {
        let mut classifier =
            FailureClassifier::default().with_timeout_retryable(self.retry.retry_on_timeout);
        for code in &self.retry.exit_codes {
            classifier = classifier.with_signature(FailureSignature::exit_code(*code, format!("exit code {code}")));
        }
        for pattern in &self.retry.stderr_patterns {
            let signature = FailureSignature::stderr(pattern, format!("stderr /{pattern}/"))
                .map_err(|e| ConfigError::Invalid(format!("bad stderr pattern '{pattern}': {e}")))?;
            classifier = classifier.with_signature(signature);
        }
        Ok(classifier)
    }

    /// Returns the timeout configured for `stage`.
    #[must_use]
    pub fn timeout_for(&self, stage: &str) -> Option<Duration> {
        self.timeouts.get(stage).map(|s| Duration::from_secs_f64(*s))
    }

    /// `<workspace>/images`
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.workspace.join("images")
    }

    /// `<workspace>/database.db`
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.workspace.join("database.db")
    }

    /// `<workspace>/<results>`
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.workspace.join(&self.results_name)
    }

    /// `<workspace>/<results>/reconstruction`, where the mapper writes numbered models.
    #[must_use]
    pub fn sparse_dir(&self) -> PathBuf {
        self.results_dir().join("reconstruction")
    }

    /// `<workspace>/dense`
    #[must_use]
    pub fn dense_dir(&self) -> PathBuf {
        self.workspace.join("dense")
    }

    /// `<workspace>/<results>/dense_ee`, the sparse-cloud import directory.
    #[must_use]
    pub fn dense_ee_dir(&self) -> PathBuf {
        self.results_dir().join("dense_ee")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AttemptOutcome;
    use crate::runner::ExecutionResult;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_follow_engine_conventions() {
        let config = PipelineConfig::default();
        assert_eq!(config.poisson, PoissonConfig { depth: 13, trim: 5 });
        assert_eq!(config.normals.orient_neighbors, 30);
        assert_eq!(config.stereo.variants.len(), 2);
        assert_eq!(config.stereo.variants[0].gpu_index, Some(0));
        assert_eq!(config.stereo.variants[0].max_image_size, 2400);
        assert_eq!(config.stereo.variants[1].gpu_index, Some(-1));
        assert_eq!(config.stereo.variants[1].max_image_size, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = PipelineConfig::from_json(
            r#"{
                "workspace": "/data/penguin",
                "results_name": "results_roma",
                "failure_policy": "continue-independent",
                "model_index": 1,
                "timeouts": {"dense_stereo": 3600}
            }"#,
        )
        .unwrap();

        assert_eq!(config.workspace, PathBuf::from("/data/penguin"));
        assert_eq!(config.failure_policy, FailurePolicy::ContinueIndependent);
        assert_eq!(config.model_index, Some(1));
        assert_eq!(config.timeout_for("dense_stereo"), Some(Duration::from_secs(3600)));
        assert_eq!(config.timeout_for("mapper"), None);
        assert_eq!(config.sparse_dir(), PathBuf::from("/data/penguin/results_roma/reconstruction"));
        assert_eq!(config.engine_binary, PathBuf::from("colmap"));
    }

    #[test]
    fn test_relative_workspace_is_anchored() {
        let base = Path::new("/data/runs");
        let config = PipelineConfig::new("ws").anchored_at(base);
        assert_eq!(config.database_path(), PathBuf::from("/data/runs/ws/database.db"));
        assert_eq!(config.dense_dir(), PathBuf::from("/data/runs/ws/dense"));

        let absolute = PipelineConfig::new("/srv/ws").anchored_at(base);
        assert_eq!(absolute.workspace, PathBuf::from("/srv/ws"));

        let resolved = PipelineConfig::new("ws").with_absolute_workspace().unwrap();
        assert!(resolved.workspace.is_absolute());
        assert!(resolved.workspace.ends_with("ws"));
    }

    #[test]
    fn test_load_anchors_workspace_at_config_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("reconflow.json");
        std::fs::write(&path, r#"{"workspace": "scan"}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.workspace, tmp.path().join("scan"));
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = PipelineConfig::new("ws")
            .with_engine_binary("/opt/colmap/bin/colmap")
            .with_failure_policy(FailurePolicy::ContinueIndependent)
            .with_texturing(true)
            .with_timeout("mapper", 60.0);
        let back = PipelineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.stereo.variants.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = PipelineConfig::default().with_results_name("a/b");
        assert!(config.validate().is_err());

        let config = PipelineConfig::default().with_timeout("mapper", -1.0);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.retry.stderr_patterns.push("(unclosed".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_policy_is_a_parse_error() {
        let err = PipelineConfig::from_json(r#"{"failure_policy": "sometimes"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_classifier_includes_configured_signatures() {
        let mut config = PipelineConfig::default();
        config.retry.exit_codes.push(137);
        config.retry.stderr_patterns.push("(?i)out of memory".to_string());

        let classifier = config.classifier().unwrap();
        assert_eq!(classifier.signatures().len(), 3);

        let oom = ExecutionResult {
            exit_status: Some(1),
            stderr: "CUDA: Out of memory".to_string(),
            ..ExecutionResult::default()
        };
        assert_eq!(classifier.classify(&oom).outcome, AttemptOutcome::FailedRetryable);
    }
}
