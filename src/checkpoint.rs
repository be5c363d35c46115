//! Model checkpoints: a CompactRecorder record plus a JSON metadata sidecar.

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use serde::{Deserialize, Serialize};

use crate::metrics::TrainingPhase;
use crate::model::PneumoniaModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub phase: TrainingPhase,
    pub epoch: usize,
    pub val_auc: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    /// RFC 3339 wall-clock time of the save
    pub saved_at: String,
}

impl CheckpointMetadata {
    pub fn new(
        phase: TrainingPhase,
        epoch: usize,
        val_auc: f64,
        val_loss: f64,
        learning_rate: f64,
    ) -> Self {
        Self {
            phase,
            epoch,
            val_auc,
            val_loss,
            learning_rate,
            saved_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Where the sidecar of the checkpoint at `path` lives.
pub fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Save the model at `path` (the recorder appends `.mpk`) and its metadata
/// next to it.
pub fn save_checkpoint<B: Backend>(
    model: &PneumoniaModel<B>,
    path: &Path,
    metadata: &CheckpointMetadata,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    model
        .clone()
        .save_file(path, &CompactRecorder::new())
        .map_err(|e| anyhow::anyhow!("Failed to save model: {:?}", e))?;

    let json = serde_json::to_string_pretty(metadata)?;
    let meta_path = metadata_path(path);
    std::fs::write(&meta_path, json)
        .with_context(|| format!("writing {}", meta_path.display()))?;

    log::info!(
        "Checkpoint saved to {} (epoch {}, val_auc {:.4})",
        path.display(),
        metadata.epoch,
        metadata.val_auc
    );
    Ok(())
}

/// Load weights from `path` into `model`, which must have the same
/// architecture. The freeze state of `model` is kept.
pub fn load_checkpoint<B: Backend>(
    model: PneumoniaModel<B>,
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<PneumoniaModel<B>> {
    log::info!("Loading checkpoint from {}", path.display());
    model
        .load_file(path, &CompactRecorder::new(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load model: {:?}", e))
}

/// Metadata of the checkpoint at `path`, if its sidecar exists.
pub fn read_metadata(path: &Path) -> anyhow::Result<Option<CheckpointMetadata>> {
    let meta_path = metadata_path(path);
    if !meta_path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&meta_path)?;
    let metadata = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", meta_path.display()))?;
    Ok(Some(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackboneConfig, ModelConfig};
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::{Distribution, Tensor};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn config() -> ModelConfig {
        ModelConfig::new()
            .with_backbone(
                BackboneConfig::new()
                    .with_stages(vec![1])
                    .with_base_filters(4),
            )
            .with_head_units(4)
    }

    #[test]
    fn test_save_and_load_restores_predictions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pneumonia_model_best");
        let device = NdArrayDevice::Cpu;

        let model = config().init::<TestBackend>(&device);
        let metadata = CheckpointMetadata::new(TrainingPhase::Initial, 3, 0.91, 0.32, 1e-4);
        save_checkpoint(&model, &path, &metadata).unwrap();

        assert!(path.with_extension("mpk").exists());
        assert_eq!(read_metadata(&path).unwrap().unwrap(), metadata);

        let fresh = config().init::<TestBackend>(&device);
        let loaded = load_checkpoint(fresh, &path, &device).unwrap();

        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Default, &device);
        let a: Vec<f32> = model.probabilities(x.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.probabilities(x).into_data().to_vec().unwrap();
        // the compact recorder stores half precision
        for (pa, pb) in a.iter().zip(&b) {
            assert!((pa - pb).abs() < 1e-2);
        }
    }

    #[test]
    fn test_missing_sidecar_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_metadata(&dir.path().join("nothing")).unwrap().is_none());
    }
}
