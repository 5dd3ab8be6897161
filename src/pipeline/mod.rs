//! Test-loop orchestration: contexts, steps, run metrics and the orchestrator.

mod context;
mod metrics;
mod orchestrator;
mod steps;


pub use context::{BatchContext, EntityContext, TaskContext};
pub use metrics::{MetricsReporter, MetricsSnapshot, RunMetrics};
pub use orchestrator::{CancelPolicy, CancelToken, RunOptions, RunState, RunSummary, TestOrchestrator};
pub use steps::{
    ArgmaxStep, BatchStep, ChannelsLastStep, EnsemblePredictionStep, EnsembleReduceStep, EntityStep, EvaluateStep,
};
