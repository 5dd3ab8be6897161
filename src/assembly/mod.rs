//! Entity reassembly from chunk predictions.

mod assembler;

pub use assembler::{ChunkPrediction, CompletedEntity, EntityAssembler};
