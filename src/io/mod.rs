//! Artifact persistence: object stores, zarr artifacts and background write-back.

mod artifact_writer;
mod store;
mod write_back;

pub use artifact_writer::{ArtifactWriter, PendingWrite};
pub use store::{create_output_store, get_output_prefix, get_test_dir};
pub use write_back::{AsyncWriteBack, WriteBackReport};
