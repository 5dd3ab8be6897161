//! Model collaborators: loading, checkpoint selection and ensemble inference.

pub mod checkpoint;
mod ensemble;
mod handle;

pub use checkpoint::{find_checkpoint_file, CheckpointSelector};
pub use ensemble::{argmax, softmax, EnsembleInference, Reduction, CLASS_AXIS};
pub use handle::{load_ensemble, ModelFiles, ModelHandle, ModelLoader};
