//! Contracts for loaded models and the collaborator that loads them.

use crate::model::checkpoint::{find_checkpoint_file, CheckpointSelector};
use anyhow::{Context, Result};
use ndarray::ArrayD;
use std::path::{Path, PathBuf};

/// One loaded predictive model.
pub trait ModelHandle: Send {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Raw class scores for a batch: input (batch, channels, spatial...) to
    /// output (batch, classes, spatial...).
    fn predict(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Switch off training-mode bookkeeping (gradients, dropout, ...).
    fn freeze(&mut self) {}
}

/// Files of a trained model directory.
///
/// ```text
/// <root>/model.json        model parameters
/// <root>/checkpoints/      weight checkpoints
/// ```
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub root: PathBuf,
}

impl ModelFiles {
    pub fn from_model_dir(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.root.join("model.json")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    /// Directory name, used as the model's display name.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }
}

/// Deserializes a model from its files onto a target device.
pub trait ModelLoader {
    fn load(&self, files: &ModelFiles, checkpoint: &Path, device: &str) -> Result<Box<dyn ModelHandle>>;
}

/// Load every ensemble member in order, frozen for inference.
pub fn load_ensemble(
    loader: &dyn ModelLoader,
    model_dirs: &[String],
    selector: &CheckpointSelector,
    device: &str,
) -> Result<Vec<Box<dyn ModelHandle>>> {
    let mut models = Vec::with_capacity(model_dirs.len());

    for (i, dir) in model_dirs.iter().enumerate() {
        let files = ModelFiles::from_model_dir(dir);
        tracing::info!("Loading model [{}/{}] {}", i + 1, model_dirs.len(), files.name());

        let checkpoint = find_checkpoint_file(&files.checkpoint_dir(), selector)
            .with_context(|| format!("No checkpoint for model {}", dir))?;
        tracing::debug!("Model {} checkpoint: {}", files.name(), checkpoint.display());

        let mut model = loader
            .load(&files, &checkpoint, device)
            .with_context(|| format!("Failed to load model {} from {}", dir, checkpoint.display()))?;
        model.freeze();
        models.push(model);
    }

    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Constant {
        name: String,
        frozen: Arc<AtomicUsize>,
    }

    impl ModelHandle for Constant {
        fn name(&self) -> &str {
            &self.name
        }

        fn predict(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
            Ok(input.clone())
        }

        fn freeze(&mut self) {
            self.frozen.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingLoader {
        frozen: Arc<AtomicUsize>,
    }

    impl ModelLoader for RecordingLoader {
        fn load(&self, files: &ModelFiles, checkpoint: &Path, _device: &str) -> Result<Box<dyn ModelHandle>> {
            assert!(checkpoint.starts_with(files.checkpoint_dir()));
            Ok(Box::new(Constant {
                name: files.name(),
                frozen: self.frozen.clone(),
            }))
        }
    }

    #[test]
    fn test_model_files_layout() {
        let files = ModelFiles::from_model_dir("/models/run_01");
        assert_eq!(files.model_path(), PathBuf::from("/models/run_01/model.json"));
        assert_eq!(files.checkpoint_dir(), PathBuf::from("/models/run_01/checkpoints"));
        assert_eq!(files.name(), "run_01");
    }

    #[test]
    fn test_load_ensemble_in_order_and_frozen() {
        let tmp = TempDir::new().unwrap();
        let mut dirs = Vec::new();
        for name in ["primary", "second"] {
            let ckpt = tmp.path().join(name).join("checkpoints");
            std::fs::create_dir_all(&ckpt).unwrap();
            std::fs::write(ckpt.join("checkpoint_ep002.pth"), b"w").unwrap();
            dirs.push(tmp.path().join(name).display().to_string());
        }

        let frozen = Arc::new(AtomicUsize::new(0));
        let loader = RecordingLoader { frozen: frozen.clone() };
        let models = load_ensemble(&loader, &dirs, &CheckpointSelector::Latest, "cpu").unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name(), "primary");
        assert_eq!(models[1].name(), "second");
        assert_eq!(frozen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_ensemble_missing_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let dirs = vec![tmp.path().join("empty").display().to_string()];
        let loader = RecordingLoader {
            frozen: Arc::new(AtomicUsize::new(0)),
        };
        let err = load_ensemble(&loader, &dirs, &CheckpointSelector::Best, "cpu").err().unwrap();
        assert!(err.to_string().contains("No checkpoint"));
    }
}
