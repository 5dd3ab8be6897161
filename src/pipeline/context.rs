//! Per-run, per-batch and per-entity state handed to steps and hooks.

use crate::assembly::CompletedEntity;
use crate::data::{Batch, EntityId};
use crate::eval::MetricValues;
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Run-wide state. Owned by the caller of the run; steps mutate it, hooks read it.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Device the models run on
    pub device: String,

    /// Directory for run-level output files
    pub test_dir: PathBuf,

    /// Index of the batch currently being processed
    pub batch_index: Option<usize>,

    /// Number of entities completed so far
    pub entity_index: usize,

    /// Metric values per completed entity
    pub metrics: BTreeMap<EntityId, MetricValues>,
}

impl TaskContext {
    pub fn new(device: impl Into<String>, test_dir: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            test_dir: test_dir.into(),
            batch_index: None,
            entity_index: 0,
            metrics: BTreeMap::new(),
        }
    }
}

/// State of one batch as it moves through the batch steps.
#[derive(Debug)]
pub struct BatchContext {
    pub batch: Batch,

    /// Per-member probabilities: (members, batch, classes, spatial...)
    pub ensemble: Option<ArrayD<f32>>,

    /// Reduced probabilities. Routed to the assembler once the steps finish,
    /// by then channel-last: (batch, spatial..., classes)
    pub probabilities: Option<ArrayD<f32>>,
}

impl BatchContext {
    pub fn new(batch: Batch) -> Self {
        Self {
            batch,
            ensemble: None,
            probabilities: None,
        }
    }
}

/// State of one completed entity as it moves through the entity steps.
#[derive(Debug)]
pub struct EntityContext {
    pub entity: CompletedEntity,

    /// Discrete prediction: (chunks, spatial...)
    pub prediction: Option<ArrayD<u8>>,

    pub metrics: MetricValues,
}

impl EntityContext {
    pub fn new(entity: CompletedEntity) -> Self {
        Self {
            entity,
            prediction: None,
            metrics: MetricValues::new(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.entity.id
    }
}
