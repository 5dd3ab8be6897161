//! In-memory dataset, used for small evaluations and tests.

use crate::data::{
    Batch, BatchSource, ChunkMeta, EntityId, EntityLayout, EntitySources, Placement, SourceResolver,
    TestDataset,
};
use anyhow::Result;
use ndarray::{stack, ArrayD, Axis};
use std::collections::HashMap;
use std::sync::Arc;

/// One chunk of an in-memory entity.
#[derive(Debug, Clone)]
pub struct MemoryChunk {
    pub entity: EntityId,
    pub placement: Placement,
    /// Image for this chunk: (channels, spatial...)
    pub image: ArrayD<f32>,
    /// Labels for this chunk: (spatial...)
    pub labels: ArrayD<u8>,
}

#[derive(Debug)]
struct SourceTable {
    sources: HashMap<EntityId, EntitySources>,
}

impl SourceResolver for SourceTable {
    fn sources(&self, entity: &EntityId) -> Option<EntitySources> {
        self.sources.get(entity).cloned()
    }
}

/// Dataset holding every chunk in memory, emitted in insertion order.
///
/// Chunk order is preserved exactly, so interleaved entities stay interleaved.
pub struct InMemoryDataset {
    chunks: Vec<MemoryChunk>,
    batch_size: usize,
    cursor: usize,
    batches_emitted: usize,
    layout: EntityLayout,
    sources: HashMap<EntityId, EntitySources>,
}

impl InMemoryDataset {
    pub fn new(batch_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            batch_size: batch_size.max(1),
            cursor: 0,
            batches_emitted: 0,
            layout: EntityLayout::new(),
            sources: HashMap::new(),
        }
    }

    /// Append a chunk and register its placement in the layout.
    pub fn push_chunk(&mut self, chunk: MemoryChunk) {
        self.layout.insert(chunk.entity.clone(), [chunk.placement]);
        self.chunks.push(chunk);
    }

    /// Record the original files of an entity.
    pub fn set_sources(&mut self, entity: impl Into<EntityId>, sources: EntitySources) {
        self.sources.insert(entity.into(), sources);
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl BatchSource for InMemoryDataset {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.chunks.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.chunks.len());
        let items = &self.chunks[self.cursor..end];

        let image_views: Vec<_> = items.iter().map(|c| c.image.view()).collect();
        let label_views: Vec<_> = items.iter().map(|c| c.labels.view()).collect();
        let images = stack(Axis(0), &image_views)
            .map_err(|e| anyhow::anyhow!("Chunks {}..{} have mismatched image shapes: {}", self.cursor, end, e))?;
        let labels = stack(Axis(0), &label_views)
            .map_err(|e| anyhow::anyhow!("Chunks {}..{} have mismatched label shapes: {}", self.cursor, end, e))?;

        let metas = items
            .iter()
            .map(|c| ChunkMeta {
                entity: c.entity.clone(),
                placement: c.placement,
            })
            .collect();

        let batch = Batch::new(self.batches_emitted, images, labels, metas)?;
        self.cursor = end;
        self.batches_emitted += 1;
        Ok(Some(batch))
    }

    fn restart(&mut self) -> Result<()> {
        self.cursor = 0;
        self.batches_emitted = 0;
        Ok(())
    }
}

impl TestDataset for InMemoryDataset {
    fn layout(&self) -> EntityLayout {
        self.layout.clone()
    }

    fn resolver(&self) -> Arc<dyn SourceResolver> {
        Arc::new(SourceTable {
            sources: self.sources.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn chunk(entity: &str, placement: usize, value: f32) -> MemoryChunk {
        MemoryChunk {
            entity: EntityId::from(entity),
            placement: Placement(placement),
            image: ArrayD::from_elem(IxDyn(&[1, 2, 2]), value),
            labels: ArrayD::zeros(IxDyn(&[2, 2])),
        }
    }

    #[test]
    fn test_batches_preserve_order() {
        let mut ds = InMemoryDataset::new(2);
        ds.push_chunk(chunk("A", 0, 1.0));
        ds.push_chunk(chunk("B", 0, 2.0));
        ds.push_chunk(chunk("A", 1, 3.0));

        let first = ds.next_batch().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.images.shape(), &[2, 1, 2, 2]);
        assert_eq!(first.chunks[1].entity, EntityId::from("B"));

        let second = ds.next_batch().unwrap().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second.images[[0, 0, 0, 0]], 3.0);

        assert!(ds.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_restart() {
        let mut ds = InMemoryDataset::new(8);
        ds.push_chunk(chunk("A", 0, 1.0));
        assert!(ds.next_batch().unwrap().is_some());
        assert!(ds.next_batch().unwrap().is_none());

        ds.restart().unwrap();
        let batch = ds.next_batch().unwrap().unwrap();
        assert_eq!(batch.index, 0);
    }

    #[test]
    fn test_layout_and_sources() {
        let mut ds = InMemoryDataset::new(4);
        ds.push_chunk(chunk("A", 0, 0.0));
        ds.push_chunk(chunk("A", 1, 0.0));
        ds.set_sources(
            "A",
            EntitySources {
                image_path: "/data/A_image.nii.gz".into(),
                label_path: "/data/A_label.nii.gz".into(),
            },
        );

        let layout = ds.layout();
        assert_eq!(layout.expected(&EntityId::from("A")).unwrap().len(), 2);

        let resolver = ds.resolver();
        assert!(resolver.sources(&EntityId::from("A")).is_some());
        assert!(resolver.sources(&EntityId::from("B")).is_none());
    }
}
