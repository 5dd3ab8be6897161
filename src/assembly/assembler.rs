//! Reassembly of whole entities from chunk-level predictions.

use crate::data::{EntityId, EntityLayout, Placement};
use crate::error::AssemblerError;
use ndarray::{stack, ArrayD, Axis};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Ensemble output for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkPrediction {
    pub entity: EntityId,
    pub placement: Placement,

    /// Class probabilities, channel-last: (spatial..., classes)
    pub probabilities: ArrayD<f32>,

    /// Ground truth for the chunk: (spatial...)
    pub labels: ArrayD<u8>,
}

/// A fully reassembled entity.
#[derive(Debug, Clone)]
pub struct CompletedEntity {
    pub id: EntityId,

    /// Placements in merge order (ascending)
    pub placements: Vec<Placement>,

    /// Stacked probabilities: (chunks, spatial..., classes)
    pub probabilities: ArrayD<f32>,

    /// Stacked labels: (chunks, spatial...)
    pub labels: ArrayD<u8>,
}

impl CompletedEntity {
    pub fn num_classes(&self) -> usize {
        self.probabilities.shape().last().copied().unwrap_or(0)
    }
}

/// Accumulation buffer for an entity that has not received every chunk yet.
#[derive(Debug, Default)]
struct PendingEntity {
    chunks: BTreeMap<Placement, ChunkPrediction>,
}

/// Accumulates chunk predictions until an entity is whole.
///
/// Chunk data is held only for in-flight entities: state is created on the
/// first chunk of an entity and dropped as soon as the entity completes. A
/// completed entity also leaves the layout, so all that remains of it is its
/// id, kept to reject late duplicates. Chunks merge in ascending placement order, so the merged layout
/// does not depend on arrival order.
#[derive(Debug)]
pub struct EntityAssembler {
    /// Expected placements per entity not yet completed
    layout: EntityLayout,

    /// Entities that have received some but not all chunks
    in_flight: HashMap<EntityId, PendingEntity>,

    /// Entities already emitted (ids only)
    completed: HashSet<EntityId>,
}

impl EntityAssembler {
    pub fn new(layout: EntityLayout) -> Self {
        Self {
            layout,
            in_flight: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Add one chunk. Returns the entity once its last expected chunk arrives.
    ///
    /// On error the assembler state is left exactly as it was.
    pub fn submit(&mut self, chunk: ChunkPrediction) -> Result<Option<CompletedEntity>, AssemblerError> {
        if self.completed.contains(&chunk.entity) {
            return Err(AssemblerError::DuplicatePlacement {
                entity: chunk.entity.clone(),
                placement: chunk.placement,
            });
        }

        let expected = self
            .layout
            .expected(&chunk.entity)
            .ok_or_else(|| AssemblerError::UnknownEntity {
                entity: chunk.entity.clone(),
            })?;

        if !expected.contains(&chunk.placement) {
            return Err(AssemblerError::UnexpectedPlacement {
                entity: chunk.entity.clone(),
                placement: chunk.placement,
            });
        }

        if let Some(pending) = self.in_flight.get(&chunk.entity) {
            if pending.chunks.contains_key(&chunk.placement) {
                return Err(AssemblerError::DuplicatePlacement {
                    entity: chunk.entity.clone(),
                    placement: chunk.placement,
                });
            }
            // All chunks of an entity must share a shape to be stacked
            if let Some(first) = pending.chunks.values().next() {
                if first.probabilities.shape() != chunk.probabilities.shape()
                    || first.labels.shape() != chunk.labels.shape()
                {
                    return Err(AssemblerError::ChunkShape {
                        entity: chunk.entity.clone(),
                        placement: chunk.placement,
                        expected: first.probabilities.shape().to_vec(),
                        actual: chunk.probabilities.shape().to_vec(),
                    });
                }
            }
        }

        let expected_count = expected.len();
        let entity = chunk.entity.clone();
        let pending = self.in_flight.entry(entity.clone()).or_default();
        pending.chunks.insert(chunk.placement, chunk);

        tracing::trace!(
            "Entity {}: {}/{} chunks received",
            entity,
            pending.chunks.len(),
            expected_count
        );

        if pending.chunks.len() < expected_count {
            return Ok(None);
        }

        // Every expected placement is present: merge and evict
        let pending = self.in_flight.remove(&entity).unwrap_or_default();
        self.layout.remove(&entity);
        self.completed.insert(entity.clone());
        merge(entity, pending).map(Some)
    }

    /// Number of entities with some but not all chunks received.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of entities emitted so far.
    pub fn completed(&self) -> usize {
        self.completed.len()
    }

    /// Placements still missing for an in-flight entity.
    pub fn missing_placements(&self, entity: &EntityId) -> Vec<Placement> {
        let Some(expected) = self.layout.expected(entity) else {
            return Vec::new();
        };
        match self.in_flight.get(entity) {
            Some(pending) => expected
                .iter()
                .filter(|p| !pending.chunks.contains_key(p))
                .copied()
                .collect(),
            None if self.completed.contains(entity) => Vec::new(),
            None => expected.iter().copied().collect(),
        }
    }

    /// Check that no entity was left partially assembled.
    pub fn finish(&self) -> Result<(), AssemblerError> {
        if self.in_flight.is_empty() {
            return Ok(());
        }
        let mut entities: Vec<EntityId> = self.in_flight.keys().cloned().collect();
        entities.sort();
        Err(AssemblerError::Incomplete { entities })
    }
}

/// Stack chunk tensors along a new leading axis in placement order.
fn merge(id: EntityId, pending: PendingEntity) -> Result<CompletedEntity, AssemblerError> {
    let placements: Vec<Placement> = pending.chunks.keys().copied().collect();
    let prob_views: Vec<_> = pending.chunks.values().map(|c| c.probabilities.view()).collect();
    let label_views: Vec<_> = pending.chunks.values().map(|c| c.labels.view()).collect();

    let shape_error = |expected: &[usize]| AssemblerError::ChunkShape {
        entity: id.clone(),
        placement: placements.first().copied().unwrap_or(Placement(0)),
        expected: expected.to_vec(),
        actual: Vec::new(),
    };
    let first_shape = prob_views.first().map(|v| v.shape().to_vec()).unwrap_or_default();
    let probabilities = stack(Axis(0), &prob_views).map_err(|_| shape_error(&first_shape))?;
    let labels = stack(Axis(0), &label_views).map_err(|_| shape_error(&first_shape))?;

    Ok(CompletedEntity {
        id,
        placements,
        probabilities,
        labels,
    })
}
