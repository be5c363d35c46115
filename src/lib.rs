//! Chest X-ray pneumonia classification with Burn.
//!
//! A convolutional backbone is first trained frozen with a new binary head,
//! then the last backbone layers are unfrozen and fine-tuned at a lower
//! learning rate. Both models are evaluated on the held-out test set and
//! Grad-CAM heatmaps explain individual predictions.

pub mod charts;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod gradcam;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod pipeline;
pub mod trainer;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use model::{ModelConfig, PneumoniaModel};
pub use pipeline::{run_gradcam, run_training, RunSummary};
