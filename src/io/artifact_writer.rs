//! Per-entity artifact persistence using zarrs.

use crate::data::{EntityId, EntitySources};
use anyhow::{Context, Result};
use futures::StreamExt;
use ndarray::ArrayD;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::{Array, ArrayBuilder, FillValue};
use zarrs::group::GroupBuilder;
use zarrs_object_store::AsyncObjectStore;

/// Everything persisted for one completed entity. Owned by the write task.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub entity: EntityId,

    /// Foreground probability: (chunks, spatial...)
    pub foreground: ArrayD<f32>,

    /// Discrete class prediction: (chunks, spatial...)
    pub prediction: ArrayD<u8>,

    /// Original image and label files, when the dataset knows them
    pub sources: Option<EntitySources>,
}

/// Writes entity artifacts under one output prefix.
///
/// For entity `id` the writer produces:
/// - `{id}_probabilities.zarr`: f32 foreground probability
/// - `{id}_prediction.zarr`: u8 argmax prediction
/// - `{id}_sources.json`: original file references
/// - `{id}_image.*` / `{id}_label.*`: symlinks to the originals (local unix output)
///
/// Writes for different entities touch disjoint keys and may run concurrently.
pub struct ArtifactWriter {
    store: Arc<dyn ObjectStore>,
    zarr_store: Arc<AsyncObjectStore<Arc<dyn ObjectStore>>>,
    prefix: String,
    compression_level: i32,
    local_root: Option<PathBuf>,
}

impl ArtifactWriter {
    /// Create the writer and store the root group metadata.
    ///
    /// `local_root` is the filesystem directory backing `store`, if any; it
    /// enables source symlinks.
    pub async fn create(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        compression_level: i32,
        local_root: Option<PathBuf>,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let prefix = prefix.trim_matches('/').to_string();
        let zarr_store = Arc::new(AsyncObjectStore::new(store.clone()));

        let group_path = if prefix.is_empty() { "/".to_string() } else { format!("/{}", prefix) };
        let mut builder = GroupBuilder::new();
        builder.attributes(attributes);
        let group = builder.build(zarr_store.clone(), &group_path)?;
        group.async_store_metadata().await?;

        tracing::info!("Artifact writer ready at group {}", group_path);

        Ok(Self {
            store,
            zarr_store,
            prefix,
            compression_level,
            local_root,
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Persist every artifact of one entity. Returns the payload bytes written.
    pub async fn write(&self, pending: PendingWrite) -> Result<u64> {
        let id = pending.entity.as_str();
        tracing::debug!("Writing artifacts for {}", id);
        let origin = vec![0u64; pending.foreground.ndim()];

        let name = format!("{}_probabilities.zarr", id);
        let array = self.create_array(&name, pending.foreground.shape(), "float32", 0f32).await?;
        let probabilities: Vec<f32> = pending.foreground.iter().copied().collect();
        array
            .async_store_chunk_elements(&origin, probabilities.as_slice())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {:?}", name, e))?;
        let mut bytes = (probabilities.len() * std::mem::size_of::<f32>()) as u64;

        let name = format!("{}_prediction.zarr", id);
        let array = self.create_array(&name, pending.prediction.shape(), "uint8", 0u8).await?;
        let prediction: Vec<u8> = pending.prediction.iter().copied().collect();
        array
            .async_store_chunk_elements(&origin, prediction.as_slice())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {:?}", name, e))?;
        bytes += prediction.len() as u64;

        if let Some(sources) = &pending.sources {
            let json = serde_json::to_vec_pretty(sources)?;
            bytes += json.len() as u64;
            let location = StorePath::from(self.key(&format!("{}_sources.json", id)));
            self.store
                .put(&location, PutPayload::from(json))
                .await
                .with_context(|| format!("Failed to write {}", location))?;

            if let Some(root) = &self.local_root {
                link_sources(&root.join(&self.prefix), id, sources).await?;
            }
        }

        Ok(bytes)
    }

    /// Replace any existing array at `name` with a fresh single-chunk array.
    async fn create_array(
        &self,
        name: &str,
        shape: &[usize],
        data_type: &str,
        fill: impl Into<FillValue>,
    ) -> Result<Array<AsyncObjectStore<Arc<dyn ObjectStore>>>> {
        self.delete_prefix(name).await;

        let shape: Vec<u64> = shape.iter().map(|&d| d as u64).collect();
        let fill: FillValue = fill.into();
        let mut builder = ArrayBuilder::new(shape.clone(), shape.clone(), data_type, fill);
        builder.dimension_names(Some(dimension_names(shape.len())));
        builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(self.compression_level, false))]);

        let array_path = format!("/{}", self.key(name));
        let array = builder
            .build(self.zarr_store.clone(), &array_path)
            .with_context(|| format!("Failed to create array {}", array_path))?;
        array.async_store_metadata().await?;
        Ok(array)
    }

    /// Remove objects left by a previous run so re-runs produce identical trees.
    async fn delete_prefix(&self, name: &str) {
        let prefix = StorePath::from(self.key(name));
        let existing: Vec<_> = self.store.list(Some(&prefix)).collect().await;

        for meta in existing.into_iter().flatten() {
            if let Err(e) = self.store.delete(&meta.location).await {
                tracing::warn!("Failed to delete {:?}: {}", meta.location, e);
            }
        }
    }
}

/// `slice, y, x` for volumes; generic names otherwise.
fn dimension_names(ndim: usize) -> Vec<Option<String>> {
    match ndim {
        3 => vec![Some("slice".to_string()), Some("y".to_string()), Some("x".to_string())],
        _ => (0..ndim).map(|i| Some(format!("dim_{}", i))).collect(),
    }
}

/// Everything after the first '.' of the file name, e.g. `.nii.gz`.
fn full_extension(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.find('.').map(|i| n[i..].to_string()))
        .unwrap_or_default()
}

#[cfg(unix)]
async fn link_sources(dir: &Path, id: &str, sources: &EntitySources) -> Result<()> {
    for (role, target) in [("image", &sources.image_path), ("label", &sources.label_path)] {
        let link = dir.join(format!("{}_{}{}", id, role, full_extension(target)));
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            tokio::fs::remove_file(&link).await?;
        }
        tokio::fs::symlink(target, &link)
            .await
            .with_context(|| format!("Failed to link {} -> {}", link.display(), target.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn link_sources(_dir: &Path, id: &str, _sources: &EntitySources) -> Result<()> {
    tracing::debug!("Skipping source links for {} (unsupported platform)", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_extension() {
        assert_eq!(full_extension(Path::new("/data/case_01.nii.gz")), ".nii.gz");
        assert_eq!(full_extension(Path::new("/data/case_01.png")), ".png");
        assert_eq!(full_extension(Path::new("/data/case_01")), "");
    }

    #[test]
    fn test_dimension_names() {
        assert_eq!(dimension_names(3)[0].as_deref(), Some("slice"));
        assert_eq!(dimension_names(2)[1].as_deref(), Some("dim_1"));
    }

    #[tokio::test]
    async fn test_write_local_artifacts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let image = tmp.path().join("case.nii.gz");
        let label = tmp.path().join("case_seg.nii.gz");
        std::fs::write(&image, b"image").unwrap();
        std::fs::write(&label, b"label").unwrap();

        let store: Arc<dyn ObjectStore> =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(&out).unwrap());
        let writer = ArtifactWriter::create(store, "", 3, Some(out.clone()), serde_json::Map::new())
            .await
            .unwrap();

        let pending = PendingWrite {
            entity: EntityId::from("A"),
            foreground: ArrayD::from_elem(ndarray::IxDyn(&[2, 3, 3]), 0.25f32),
            prediction: ArrayD::from_elem(ndarray::IxDyn(&[2, 3, 3]), 1u8),
            sources: Some(EntitySources {
                image_path: image.clone(),
                label_path: label,
            }),
        };

        let bytes = writer.write(pending.clone()).await.unwrap();
        assert!(bytes >= 18 * 5);
        assert!(out.join("A_probabilities.zarr").join("zarr.json").exists());
        assert!(out.join("A_prediction.zarr").join("zarr.json").exists());
        assert!(out.join("A_sources.json").exists());

        #[cfg(unix)]
        assert_eq!(std::fs::read_link(out.join("A_image.nii.gz")).unwrap(), image);

        // Rewriting the same entity replaces the previous artifacts and links
        std::fs::remove_file(&image).unwrap();
        std::fs::write(&image, b"image v2").unwrap();
        writer.write(pending).await.unwrap();
        assert!(out.join("A_prediction.zarr").join("zarr.json").exists());
        #[cfg(unix)]
        assert_eq!(std::fs::read(out.join("A_image.nii.gz")).unwrap(), b"image v2");
    }
}
