//! Batches, chunk metadata and the dataset collaborator contracts.

use anyhow::Result;
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Identifier of an entity (one subject / volume).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a chunk within its entity (slice index along the stacking axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Placement(pub usize);

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slice {}", self.0)
    }
}

/// Routing metadata for one chunk of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub entity: EntityId,
    pub placement: Placement,
}

impl ChunkMeta {
    pub fn new(entity: impl Into<EntityId>, placement: usize) -> Self {
        Self {
            entity: entity.into(),
            placement: Placement(placement),
        }
    }
}

/// A unit of work pulled from the dataset.
///
/// The leading axis of `images` and `labels` indexes chunks; `chunks[i]`
/// describes item `i`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch in the source sequence
    pub index: usize,

    /// Input images: (batch, channels, spatial...)
    pub images: ArrayD<f32>,

    /// Ground-truth labels: (batch, spatial...)
    pub labels: ArrayD<u8>,

    /// One entry per leading-axis item
    pub chunks: Vec<ChunkMeta>,
}

impl Batch {
    /// Build a batch, checking that images, labels and metadata agree in length.
    pub fn new(
        index: usize,
        images: ArrayD<f32>,
        labels: ArrayD<u8>,
        chunks: Vec<ChunkMeta>,
    ) -> Result<Self> {
        if images.ndim() < 2 {
            anyhow::bail!("Batch {} images must be at least 2-d, got {:?}", index, images.shape());
        }
        let n = chunks.len();
        if images.len_of(Axis(0)) != n || labels.ndim() == 0 || labels.len_of(Axis(0)) != n {
            anyhow::bail!(
                "Batch {} has {} chunk entries but images {:?} and labels {:?}",
                index,
                n,
                images.shape(),
                labels.shape()
            );
        }
        Ok(Self {
            index,
            images,
            labels,
            chunks,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Expected placements per entity, known before the run from dataset metadata.
#[derive(Debug, Clone, Default)]
pub struct EntityLayout {
    expected: HashMap<EntityId, BTreeSet<Placement>>,
}

impl EntityLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity made of `num_chunks` consecutive slices starting at 0.
    pub fn with_slices(mut self, entity: impl Into<EntityId>, num_chunks: usize) -> Self {
        self.insert(entity, (0..num_chunks).map(Placement));
        self
    }

    /// Register (or extend) an entity's expected placements.
    pub fn insert(&mut self, entity: impl Into<EntityId>, placements: impl IntoIterator<Item = Placement>) {
        self.expected
            .entry(entity.into())
            .or_default()
            .extend(placements);
    }

    pub fn expected(&self, entity: &EntityId) -> Option<&BTreeSet<Placement>> {
        self.expected.get(entity)
    }

    /// Stop tracking an entity, returning its expected placements.
    pub fn remove(&mut self, entity: &EntityId) -> Option<BTreeSet<Placement>> {
        self.expected.remove(entity)
    }

    pub fn num_entities(&self) -> usize {
        self.expected.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.expected.values().map(|p| p.len()).sum()
    }
}

/// Original files an entity was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySources {
    pub image_path: PathBuf,
    pub label_path: PathBuf,
}

/// Finite, restartable sequence of batches.
///
/// `Ok(None)` signals normal exhaustion; `Err` is a source failure.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch>>;

    /// Rewind to the first batch.
    fn restart(&mut self) -> Result<()>;
}

/// Resolves an entity back to its source files (used by persistence only).
pub trait SourceResolver: Send + Sync {
    fn sources(&self, entity: &EntityId) -> Option<EntitySources>;
}

/// A test dataset: batches plus the metadata the orchestrator needs up front.
pub trait TestDataset: BatchSource {
    fn layout(&self) -> EntityLayout;

    fn resolver(&self) -> std::sync::Arc<dyn SourceResolver>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_batch_length_validation() {
        let images = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 4, 4]));
        let labels = ArrayD::<u8>::zeros(IxDyn(&[2, 4, 4]));

        let ok = Batch::new(0, images.clone(), labels.clone(), vec![ChunkMeta::new("A", 0), ChunkMeta::new("A", 1)]);
        assert!(ok.is_ok());
        assert_eq!(ok.unwrap().len(), 2);

        let bad = Batch::new(1, images, labels, vec![ChunkMeta::new("A", 0)]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_layout_counts() {
        let layout = EntityLayout::new().with_slices("A", 3).with_slices("B", 2);
        assert_eq!(layout.num_entities(), 2);
        assert_eq!(layout.num_chunks(), 5);
        assert!(layout.expected(&EntityId::from("A")).unwrap().contains(&Placement(2)));
        assert!(layout.expected(&EntityId::from("C")).is_none());
    }

    #[test]
    fn test_placement_ordering() {
        let mut placements = vec![Placement(2), Placement(0), Placement(1)];
        placements.sort();
        assert_eq!(placements, vec![Placement(0), Placement(1), Placement(2)]);
    }
}
