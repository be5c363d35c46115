pub mod augmentation;
pub mod batcher;
pub mod dataset;
pub mod loader;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use batcher::{XrayBatch, XrayBatcher, XrayItem};
pub use dataset::{class_weights, load_rgb, DataConfig, DatasetSplits, XrayDataset, XrayLabel};
pub use loader::XrayDataLoader;
