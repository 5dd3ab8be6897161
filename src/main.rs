//! Ensemble evaluation CLI
//!
//! Configuration tooling for evaluation runs. Model loading and datasets are
//! supplied by the embedding application through the library API.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ensemble_eval::model::{find_checkpoint_file, ModelFiles};
use ensemble_eval::Config;

#[derive(Parser)]
#[command(name = "ensemble-eval")]
#[command(about = "Evaluate model ensembles on chunked test datasets", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration
    Validate,

    /// Resolve the checkpoint each ensemble member would be tested at
    Checkpoints,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => validate_command(&cli.config)?,
        Commands::Checkpoints => checkpoints_command(&cli.config)?,
        Commands::GenerateConfig { output } => generate_config_command(&output)?,
    }

    Ok(())
}

fn validate_command(config_path: &PathBuf) -> Result<()> {
    let config = Config::from_file(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    println!("  Models: {}", config.models.model_dirs.len());
    println!("  Reduction: {:?}", config.ensemble.reduction);
    println!("  Output: {}", config.output.path_display());
    Ok(())
}

fn checkpoints_command(config_path: &PathBuf) -> Result<()> {
    let config = Config::from_file(config_path)?;
    config.validate()?;

    let mut missing = 0;
    for dir in &config.models.model_dirs {
        let files = ModelFiles::from_model_dir(dir);
        match find_checkpoint_file(&files.checkpoint_dir(), &config.models.test_at) {
            Ok(path) => println!("{}: {}", files.name(), path.display()),
            Err(e) => {
                missing += 1;
                println!("{}: {:#}", files.name(), e);
            }
        }
    }

    if missing > 0 {
        anyhow::bail!("{} of {} models have no '{}' checkpoint", missing, config.models.model_dirs.len(), config.models.test_at);
    }
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Ensemble Evaluation Configuration

# === MODELS: Ensemble members ===
models:
  # Trained model directories, each with a checkpoints/ subdirectory.
  # The first model is the primary one.
  model_dirs:
    - "/models/fold_0"
    - "/models/fold_1"
    - "/models/fold_2"

  # Checkpoint to test: best, latest or an epoch number
  test_at: best

  # Device handed to the model loader
  device: "cpu"

# === ENSEMBLE: How member probabilities are combined ===
ensemble:
  # mean, vote, or weighted: [w0, w1, ...] (one weight per model)
  reduction: mean

# === OUTPUT: Where to write artifacts ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
output:
  # Option 1: Write to local filesystem
  local_path: "/tmp/ensemble-eval"

  # Option 2: Write to S3 (comment out local_path and uncomment these)
  # bucket: "output-bucket"
  # prefix: "eval/run-01"

  # Per-entity metrics file, relative to the test directory
  metrics_csv: "metrics.csv"

  # Persist probability and prediction arrays per entity
  write_artifacts: true

  # Zstd compression level (0-22, higher = smaller but slower)
  compression_level: 3

# === PROCESSING: Background writes and reporting ===
processing:
  # Maximum concurrent artifact writes
  write_concurrency: 4

  # Background write failures tolerated before the run fails
  write_failure_tolerance: 0

  # Tokio worker threads for background writes (null = num CPUs)
  # worker_threads: 4

  # Print throughput metrics during the run
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save run metrics as JSON after the run
  # metrics_output_path: "/tmp/ensemble-eval/run_metrics.json"

  # Pending writes on cancellation: flush or abort
  cancel_policy: flush
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
