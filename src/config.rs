//! Configuration for an ensemble evaluation run.

use crate::error::ConfigurationError;
use crate::model::{CheckpointSelector, Reduction};
use crate::pipeline::CancelPolicy;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Main configuration for an evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ensemble members and checkpoint selection
    pub models: ModelsConfig,

    /// How member probabilities are combined
    #[serde(default)]
    pub ensemble: EnsembleConfig,

    /// Output configuration
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Ensemble member configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model directories, primary model first.
    /// Accepts a single path or a list.
    #[serde(alias = "model_dir", deserialize_with = "one_or_many")]
    pub model_dirs: Vec<String>,

    /// Checkpoint to test: `best`, `latest` or an epoch number
    #[serde(default = "default_test_at")]
    pub test_at: CheckpointSelector,

    /// Device string handed to the model loader
    #[serde(default = "default_device")]
    pub device: String,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(dir) => vec![dir],
        OneOrMany::Many(dirs) => dirs,
    })
}

/// Ensemble reduction configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub reduction: Reduction,
}

/// Output artifact configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local directory for artifacts.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Output S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Output S3 path prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Per-entity metrics file name, relative to the test directory
    #[serde(default = "default_metrics_csv")]
    pub metrics_csv: String,

    /// Persist probability and prediction arrays per entity
    #[serde(default = "default_true")]
    pub write_artifacts: bool,

    /// Compression level (0-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl OutputConfig {
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Output location as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }

    pub fn local_path(&self) -> Option<&str> {
        self.local_path.as_deref()
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum concurrent background writes
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,

    /// Background write failures tolerated before the run fails
    #[serde(default)]
    pub write_failure_tolerance: usize,

    /// Number of Tokio worker threads for background writes
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save run metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// What happens to pending writes when the run is cancelled
    #[serde(default)]
    pub cancel_policy: CancelPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            write_concurrency: default_write_concurrency(),
            write_failure_tolerance: 0,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
            cancel_policy: CancelPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration. Runs before any batch is pulled.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match (&self.output.local_path, &self.output.bucket, &self.output.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(ConfigurationError::invalid(
                    "Cannot specify both local_path and bucket/prefix",
                ));
            }
            (None, None, _) | (None, _, None) => {
                return Err(ConfigurationError::invalid(
                    "Must specify either local_path or both bucket and prefix",
                ));
            }
            _ => {}
        }

        if self.models.model_dirs.is_empty() {
            return Err(ConfigurationError::EmptyEnsemble);
        }
        if self.models.model_dirs.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigurationError::invalid("Model directories must not be empty strings"));
        }
        self.ensemble.reduction.validate(self.models.model_dirs.len())?;

        if self.output.metrics_csv.trim().is_empty() {
            return Err(ConfigurationError::invalid("metrics_csv must name a file"));
        }
        if self.output.compression_level < 0 || self.output.compression_level > 22 {
            return Err(ConfigurationError::invalid("Compression level must be 0-22 for zstd"));
        }
        if self.processing.write_concurrency == 0 {
            return Err(ConfigurationError::invalid("write_concurrency must be > 0"));
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            return Err(ConfigurationError::invalid("metrics_interval_secs must be > 0"));
        }
        Ok(())
    }
}

fn default_test_at() -> CheckpointSelector { CheckpointSelector::Best }
fn default_device() -> String { "cpu".to_string() }
fn default_metrics_csv() -> String { "metrics.csv".to_string() }
fn default_true() -> bool { true }
fn default_compression_level() -> i32 { 3 }
fn default_write_concurrency() -> usize { 4 }
fn default_metrics_interval() -> u64 { 10 }
