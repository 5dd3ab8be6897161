//! Ensemble Evaluation
//!
//! Runs a trained ensemble over a chunked test dataset, reassembles chunk
//! predictions into whole entities, scores them and persists per-entity
//! artifacts in the background.
//!
//! # Architecture
//!
//! - **Data**: batch source and entity layout contracts
//! - **Model**: checkpoint discovery, model loading and ensemble inference
//! - **Assembly**: out-of-order chunk reassembly into entities
//! - **Eval**: overlap metrics and run summaries
//! - **Hooks**: ordered observers (console, metrics CSV, artifact writes)
//! - **I/O**: object store setup, zarr artifacts and async write-back
//! - **Pipeline**: the synchronous test loop with a single drain-time join
//!
//! # Usage
//!
//! ```no_run
//! use ensemble_eval::{build_runtime, run_evaluation, Config};
//! # use ensemble_eval::data::InMemoryDataset;
//! # fn loader() -> Box<dyn ensemble_eval::model::ModelLoader> { unimplemented!() }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let runtime = build_runtime(config.processing.worker_threads)?;
//!     let mut dataset = InMemoryDataset::new(8);
//!     let summary = run_evaluation(&config, loader().as_ref(), &mut dataset, &runtime)?;
//!     println!("{} entities evaluated", summary.entities.len());
//!     Ok(())
//! }
//! ```

pub mod assembly;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod hooks;
pub mod io;
pub mod model;
pub mod pipeline;

pub use config::Config;
pub use error::RunError;
pub use pipeline::{RunState, RunSummary, TestOrchestrator};

use anyhow::Result;
use data::TestDataset;
use eval::{Dice, Jaccard, MetricsEvaluator};
use hooks::{ArtifactWriteHook, ConsoleLogHook, HookChain, MetricsCsvHook, ProbabilityStatsHook, TestLoopHook};
use io::{ArtifactWriter, AsyncWriteBack};
use model::{load_ensemble, EnsembleInference, ModelLoader};
use pipeline::{
    ArgmaxStep, BatchStep, ChannelsLastStep, EnsemblePredictionStep, EnsembleReduceStep, EntityStep, EvaluateStep,
    MetricsReporter, RunMetrics, RunOptions, TaskContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Run a full evaluation with the given configuration.
///
/// Blocks the calling thread; `runtime` only carries background writes and
/// progress reporting, so this must not be called from inside it.
pub fn run_evaluation(
    config: &Config,
    loader: &dyn ModelLoader,
    dataset: &mut dyn TestDataset,
    runtime: &Runtime,
) -> Result<RunSummary> {
    config.validate()?;
    tracing::info!("Starting ensemble evaluation");

    // Models
    let models = load_ensemble(
        loader,
        &config.models.model_dirs,
        &config.models.test_at,
        &config.models.device,
    )?;
    let ensemble = EnsembleInference::new(models)?;
    tracing::info!("Ensemble: [{}]", ensemble.model_names().join(", "));
    let attributes = run_attributes(config, &ensemble);

    // Output
    let test_dir = io::get_test_dir(config);
    std::fs::create_dir_all(&test_dir)?;
    tracing::info!("Writing results to: {}", config.output.path_display());

    let metrics = RunMetrics::new();
    let write_back = Arc::new(AsyncWriteBack::new(
        runtime.handle().clone(),
        config.processing.write_concurrency,
    ));

    let layout = dataset.layout();
    tracing::info!(
        "Dataset: {} entities in {} chunks",
        layout.num_entities(),
        layout.num_chunks()
    );

    // Hooks, in delivery order
    let mut hooks: Vec<Box<dyn TestLoopHook>> = vec![
        Box::new(ProbabilityStatsHook),
        Box::new(ConsoleLogHook::new(Some(layout.num_entities()))),
        Box::new(MetricsCsvHook::new(&config.output.metrics_csv)),
    ];
    if config.output.write_artifacts {
        let store = io::create_output_store(config)?;
        let writer = runtime.block_on(ArtifactWriter::create(
            store,
            io::get_output_prefix(config),
            config.output.compression_level,
            config.output.local_path().map(PathBuf::from),
            attributes,
        ))?;
        hooks.push(Box::new(ArtifactWriteHook::new(
            Arc::new(writer),
            write_back.clone(),
            dataset.resolver(),
            metrics.clone(),
        )));
    }

    let batch_steps: Vec<Box<dyn BatchStep>> = vec![
        Box::new(EnsemblePredictionStep::new(ensemble)),
        Box::new(EnsembleReduceStep::new(config.ensemble.reduction.clone())),
        Box::new(ChannelsLastStep),
    ];
    let evaluator = MetricsEvaluator::new(vec![Box::new(Dice), Box::new(Jaccard)])?;
    let entity_steps: Vec<Box<dyn EntityStep>> = vec![Box::new(ArgmaxStep), Box::new(EvaluateStep::new(evaluator))];

    let mut orchestrator = TestOrchestrator::new(
        batch_steps,
        entity_steps,
        HookChain::reducing(hooks),
        write_back,
        metrics.clone(),
        RunOptions {
            write_failure_tolerance: config.processing.write_failure_tolerance,
            cancel_policy: config.processing.cancel_policy,
        },
    );

    // Progress reporting
    let reporter = if config.processing.enable_metrics {
        let (tx, rx) = mpsc::channel::<()>(1);
        let reporter = MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            layout.num_chunks() as u64,
        );
        let handle = runtime.spawn(reporter.run(rx));
        Some((tx, handle))
    } else {
        None
    };

    let mut task = TaskContext::new(config.models.device.clone(), test_dir);
    let result = orchestrator.run(dataset, &mut task);

    if let Some((tx, handle)) = reporter {
        drop(tx);
        if let Err(e) = runtime.block_on(handle) {
            tracing::warn!("Metrics reporter failed: {}", e);
        }
    }

    let summary = result?;
    if config.processing.enable_metrics {
        summary.metrics.print_summary();
    }

    if let Some(path) = &config.processing.metrics_output_path {
        summary.metrics.save_to_file(path)?;
        tracing::info!("Run metrics saved to {}", path);
    }

    Ok(summary)
}

/// Group attributes stored with the artifacts.
fn run_attributes(config: &Config, ensemble: &EnsembleInference) -> serde_json::Map<String, serde_json::Value> {
    let mut attributes = serde_json::Map::new();
    attributes.insert(
        "models".to_string(),
        serde_json::json!(ensemble.model_names()),
    );
    attributes.insert(
        "test_at".to_string(),
        serde_json::json!(config.models.test_at.to_string()),
    );
    attributes.insert(
        "reduction".to_string(),
        serde_json::to_value(&config.ensemble.reduction).unwrap_or(serde_json::Value::Null),
    );
    attributes
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
