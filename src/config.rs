use std::path::Path;

use burn::config::Config;

use crate::{
    data::DataConfig,
    error::{self, PipelineError},
    model::ModelConfig,
    trainer::{FineTuneConfig, TrainingConfig},
};

/// Every hyperparameter of a run. Saved as `config.json` next to the
/// outputs so a run can be repeated with `--config`.
#[derive(Config, Debug)]
pub struct PipelineConfig {
    #[config(default = "DataConfig::new()")]
    pub data: DataConfig,
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "TrainingConfig::new()")]
    pub training: TrainingConfig,
    #[config(default = "FineTuneConfig::new()")]
    pub fine_tune: FineTuneConfig,
    /// Probability above which an image is classified as pneumonia
    #[config(default = 0.5)]
    pub threshold: f32,
    /// Seeds shuffling and augmentation; unseeded runs are not reproducible
    pub seed: Option<u64>,
    /// Convolution used for Grad-CAM, the last one when unset
    pub gradcam_layer: Option<String>,
}

impl PipelineConfig {
    pub fn validate(&self) -> error::Result<()> {
        self.data.validate()?;
        self.training.validate()?;
        self.fine_tune.validate()?;
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(PipelineError::Config(format!(
                "threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(PipelineError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.model.backbone.stages.is_empty() || self.model.backbone.stages.contains(&0) {
            return Err(PipelineError::Config(
                "every backbone stage needs at least one convolution".into(),
            ));
        }
        let min_side = 1usize << self.model.backbone.stages.len();
        if self.data.image_size < min_side {
            return Err(PipelineError::Config(format!(
                "image_size {} is too small for {} pooling stages",
                self.data.image_size,
                self.model.backbone.stages.len()
            )));
        }
        Ok(())
    }

    /// Load a saved configuration and validate it.
    pub fn from_file(path: &Path) -> error::Result<Self> {
        let config = Self::load(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}
