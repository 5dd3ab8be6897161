//! Dataset contracts: batches, chunk placement and entity metadata.

mod batch;
mod memory;

pub use batch::{
    Batch, BatchSource, ChunkMeta, EntityId, EntityLayout, EntitySources, Placement, SourceResolver,
    TestDataset,
};
pub use memory::{InMemoryDataset, MemoryChunk};
