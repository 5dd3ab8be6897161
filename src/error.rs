//! Error taxonomy for the evaluation run.
//!
//! Synchronous-path errors are fatal for the run and carry enough context to
//! name the component and the batch or entity involved. Background write
//! failures are collected and surfaced in aggregate at join time.

use crate::data::{EntityId, Placement};
use thiserror::Error;

/// Missing or invalid settings, reported before any batch is pulled.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Metric name '{name}' is produced by more than one metric")]
    DuplicateMetric { name: String },
    #[error("Ensemble must contain at least one model")]
    EmptyEnsemble,
    #[error("Orchestrator is not reusable (current state: {0})")]
    NotReusable(String),
}

impl ConfigurationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Assembler invariant violations. These indicate a dataset or metadata bug.
#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("Unknown entity '{entity}' (no expected placements registered)")]
    UnknownEntity { entity: EntityId },
    #[error("Duplicate placement {placement} for entity '{entity}'")]
    DuplicatePlacement { entity: EntityId, placement: Placement },
    #[error("Placement {placement} is not expected for entity '{entity}'")]
    UnexpectedPlacement { entity: EntityId, placement: Placement },
    #[error("Chunk shape mismatch for entity '{entity}' at {placement}: expected {expected:?}, got {actual:?}")]
    ChunkShape {
        entity: EntityId,
        placement: Placement,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{} entities still incomplete at drain: {:?}", .entities.len(), .entities)]
    Incomplete { entities: Vec<EntityId> },
}

/// A model failed to produce a usable output for a batch.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model {index} ('{name}') failed: {source}")]
    Model {
        index: usize,
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Model {index} ('{name}') produced output of shape {shape:?}; expected (batch, classes >= 1, ...)")]
    InvalidOutput { index: usize, name: String, shape: Vec<usize> },
    #[error("Model {index} output shape {actual:?} differs from model 0 shape {expected:?}")]
    InconsistentOutputs {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Prediction and ground truth disagree in spatial shape.
#[derive(Debug, Error)]
#[error("Shape mismatch: prediction {prediction:?} vs target {target:?}")]
pub struct ShapeMismatchError {
    pub prediction: Vec<usize>,
    pub target: Vec<usize>,
}

/// One background write that did not complete.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    /// Label the task was submitted with (usually the entity id)
    pub label: String,
    /// Rendered cause
    pub cause: String,
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.label, self.cause)
    }
}

/// Aggregated background write failures, surfaced at join.
#[derive(Debug, Error)]
#[error("{} background write(s) failed (tolerance {tolerance}); first: {}", .failures.len(), first_failure(.failures))]
pub struct PersistenceError {
    pub failures: Vec<WriteFailure>,
    pub tolerance: usize,
}

fn first_failure(failures: &[WriteFailure]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Lifecycle event a hook was handling when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    BatchEnd,
    EntityEnd,
    RunEnd,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookEvent::BatchEnd => "batch_end",
            HookEvent::EntityEnd => "entity_end",
            HookEvent::RunEnd => "run_end",
        };
        f.write_str(name)
    }
}

/// A hook raised while handling an event.
#[derive(Debug, Error)]
#[error("Hook '{hook}' failed during {event}: {source}")]
pub struct HookError {
    pub hook: String,
    pub event: HookEvent,
    #[source]
    pub source: anyhow::Error,
}

/// Fatal outcome of an orchestrator run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Batch source failed after {batches} batches: {source}")]
    ExhaustedSource {
        batches: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Batch step '{step}' failed on batch {batch}: {source}")]
    BatchStep {
        step: String,
        batch: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Entity step '{step}' failed on entity '{entity}': {source}")]
    EntityStep {
        step: String,
        entity: EntityId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Assembler failed on batch {batch}: {source}")]
    Assembler {
        batch: usize,
        #[source]
        source: AssemblerError,
    },

    #[error("Invalid batch output on batch {batch}: {reason}")]
    BatchOutput { batch: usize, reason: String },

    #[error("Hook chain failed ({scope}): {source}")]
    Hook {
        scope: String,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Run cancelled after {batches} batches")]
    Cancelled { batches: usize },
}
