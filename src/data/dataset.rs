use std::path::{Path, PathBuf};

use burn::config::Config;
use image::{imageops::FilterType, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};

use crate::data::augmentation::AugmentationConfig;
use crate::error::{self, PipelineError};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Config, Debug)]
pub struct DataConfig {
    /// Side of the square input resolution
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    /// Fraction of each training class held out for validation
    #[config(default = 0.2)]
    pub validation_split: f64,
    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,
}

impl DataConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.image_size == 0 {
            return Err(PipelineError::Config("image_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(PipelineError::Config(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        self.augmentation.validate()
    }
}

/// Binary label. Index order follows the sorted class folder names, so
/// `NORMAL` is 0 and `PNEUMONIA` (the positive class) is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XrayLabel {
    Normal,
    Pneumonia,
}

impl XrayLabel {
    pub const ALL: [XrayLabel; 2] = [XrayLabel::Normal, XrayLabel::Pneumonia];

    pub fn to_index(&self) -> usize {
        match self {
            XrayLabel::Normal => 0,
            XrayLabel::Pneumonia => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(XrayLabel::Normal),
            1 => Some(XrayLabel::Pneumonia),
            _ => None,
        }
    }

    /// Folder name used by the chest X-ray dataset layout
    pub fn dir_name(&self) -> &'static str {
        match self {
            XrayLabel::Normal => "NORMAL",
            XrayLabel::Pneumonia => "PNEUMONIA",
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, XrayLabel::Pneumonia)
    }

    /// Strictly greater than the threshold is positive; a probability equal
    /// to the threshold is negative.
    pub fn from_probability(probability: f32, threshold: f32) -> Self {
        if probability > threshold {
            XrayLabel::Pneumonia
        } else {
            XrayLabel::Normal
        }
    }
}

impl std::fmt::Display for XrayLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Images of one split, listed from disk but decoded lazily.
#[derive(Debug, Clone)]
pub struct XrayDataset {
    pub items: Vec<(PathBuf, XrayLabel)>,
    pub image_size: usize,
}

impl XrayDataset {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// List a split directory holding one subfolder per class.
    ///
    /// Files are sorted by name inside each class so that splits and the
    /// test order are reproducible.
    pub fn from_class_dirs(split_dir: &Path, image_size: usize) -> error::Result<Self> {
        if !split_dir.is_dir() {
            return Err(PipelineError::MissingDirectory(split_dir.to_path_buf()));
        }

        let mut items = Vec::new();
        for label in XrayLabel::ALL {
            let class_dir = split_dir.join(label.dir_name());
            if !class_dir.is_dir() {
                return Err(PipelineError::MissingClassFolder {
                    dir: split_dir.to_path_buf(),
                    class: label.dir_name().to_string(),
                });
            }
            let mut paths = list_images(&class_dir)?;
            paths.sort();
            items.extend(paths.into_iter().map(|path| (path, label)));
        }

        Ok(Self { items, image_size })
    }

    /// Hold out `fraction` of every class for validation.
    ///
    /// The first `floor(n * fraction)` files of each class (in listing order)
    /// become the validation subset, the remainder the training subset.
    pub fn split_validation(self, fraction: f64) -> (Self, Self) {
        let mut train = Vec::new();
        let mut validation = Vec::new();

        for label in XrayLabel::ALL {
            let class_items: Vec<_> = self
                .items
                .iter()
                .filter(|(_, l)| *l == label)
                .cloned()
                .collect();
            let n_val = (class_items.len() as f64 * fraction).floor() as usize;
            let (val_part, train_part) = class_items.split_at(n_val);
            validation.extend_from_slice(val_part);
            train.extend_from_slice(train_part);
        }

        (
            XrayDataset {
                items: train,
                image_size: self.image_size,
            },
            XrayDataset {
                items: validation,
                image_size: self.image_size,
            },
        )
    }

    /// `[normal, pneumonia]` counts
    pub fn class_counts(&self) -> [usize; 2] {
        let mut counts = [0usize; 2];
        for (_, label) in &self.items {
            counts[label.to_index()] += 1;
        }
        counts
    }

    pub fn labels(&self) -> Vec<XrayLabel> {
        self.items.iter().map(|(_, label)| *label).collect()
    }

    /// Decode the image at `index` and resize it to the model resolution.
    pub fn load_resized(&self, index: usize) -> error::Result<(RgbImage, XrayLabel)> {
        let (path, label) = self
            .items
            .get(index)
            .ok_or_else(|| PipelineError::Config(format!("sample index {index} out of range")))?;
        let image = load_rgb(path)?;
        let size = self.image_size as u32;
        let resized = image::imageops::resize(&image, size, size, FilterType::Triangle);
        Ok((resized, *label))
    }
}

/// Open an image file as 8-bit RGB.
pub fn load_rgb(path: &Path) -> error::Result<RgbImage> {
    let reader = ImageReader::open(path)
        .map_err(|e| PipelineError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    let decoded = reader
        .with_guessed_format()
        .map_err(|e| PipelineError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| PipelineError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    Ok(decoded.to_rgb8())
}

fn list_images(dir: &Path) -> error::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Train, validation and test subsets of one dataset root.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: XrayDataset,
    pub validation: XrayDataset,
    pub test: XrayDataset,
}

impl DatasetSplits {
    /// Load `<root>/train` and `<root>/test`, carving validation out of train.
    pub fn load(root: &Path, config: &DataConfig) -> error::Result<Self> {
        if !root.is_dir() {
            return Err(PipelineError::MissingDirectory(root.to_path_buf()));
        }
        let full_train = XrayDataset::from_class_dirs(&root.join("train"), config.image_size)?;
        let test = XrayDataset::from_class_dirs(&root.join("test"), config.image_size)?;
        let (train, validation) = full_train.split_validation(config.validation_split);

        for (name, split) in [("train", &train), ("validation", &validation), ("test", &test)] {
            if split.is_empty() {
                return Err(PipelineError::EmptySplit(name.to_string()));
            }
        }

        Ok(Self {
            train,
            validation,
            test,
        })
    }

    pub fn log_stats(&self) {
        for (name, split) in [
            ("train", &self.train),
            ("validation", &self.validation),
            ("test", &self.test),
        ] {
            let [normal, pneumonia] = split.class_counts();
            log::info!(
                "{:<10} {:>5} images (NORMAL: {}, PNEUMONIA: {})",
                name,
                split.len(),
                normal,
                pneumonia
            );
        }
        let weights = class_weights(&self.train);
        log::info!(
            "Balanced class weights on train: NORMAL {:.3}, PNEUMONIA {:.3}",
            weights[0],
            weights[1]
        );
    }
}

/// `n_samples / (n_classes * n_class)` per class, 0 for an absent class.
pub fn class_weights(dataset: &XrayDataset) -> [f64; 2] {
    let counts = dataset.class_counts();
    let total = dataset.len() as f64;
    let mut weights = [0.0; 2];
    for (weight, count) in weights.iter_mut().zip(counts) {
        if count > 0 {
            *weight = total / (2.0 * count as f64);
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn write_images(dir: &Path, count: usize) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_pixel(8, 6, Rgb([i as u8, 10, 20]));
            img.save(dir.join(format!("img_{i:03}.png"))).unwrap();
        }
    }

    fn make_root(train: (usize, usize), test: (usize, usize)) -> TempDir {
        let root = TempDir::new().unwrap();
        write_images(&root.path().join("train/NORMAL"), train.0);
        write_images(&root.path().join("train/PNEUMONIA"), train.1);
        write_images(&root.path().join("test/NORMAL"), test.0);
        write_images(&root.path().join("test/PNEUMONIA"), test.1);
        root
    }

    #[test]
    fn test_label_threshold_boundary() {
        assert_eq!(XrayLabel::from_probability(0.5, 0.5), XrayLabel::Normal);
        assert_eq!(XrayLabel::from_probability(0.500001, 0.5), XrayLabel::Pneumonia);
        assert_eq!(XrayLabel::from_probability(0.0, 0.5), XrayLabel::Normal);
        assert_eq!(XrayLabel::from_probability(1.0, 0.5), XrayLabel::Pneumonia);
    }

    #[test]
    fn test_label_index_round_trip() {
        for label in XrayLabel::ALL {
            assert_eq!(XrayLabel::from_index(label.to_index()), Some(label));
        }
        assert_eq!(XrayLabel::from_index(2), None);
    }

    #[test]
    fn test_load_splits_counts_and_fraction() {
        let root = make_root((10, 5), (3, 4));
        let splits = DatasetSplits::load(root.path(), &DataConfig::new()).unwrap();

        // floor(10 * 0.2) = 2 and floor(5 * 0.2) = 1 go to validation
        assert_eq!(splits.validation.class_counts(), [2, 1]);
        assert_eq!(splits.train.class_counts(), [8, 4]);
        assert_eq!(splits.test.class_counts(), [3, 4]);
    }

    #[test]
    fn test_validation_takes_first_sorted_files() {
        let root = make_root((5, 5), (1, 1));
        let splits = DatasetSplits::load(root.path(), &DataConfig::new()).unwrap();
        let names: Vec<_> = splits
            .validation
            .items
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["img_000.png", "img_000.png"]);
    }

    #[test]
    fn test_test_split_keeps_listing_order() {
        let root = make_root((5, 5), (2, 3));
        let splits = DatasetSplits::load(root.path(), &DataConfig::new()).unwrap();
        let labels = splits.test.labels();
        assert_eq!(
            labels,
            vec![
                XrayLabel::Normal,
                XrayLabel::Normal,
                XrayLabel::Pneumonia,
                XrayLabel::Pneumonia,
                XrayLabel::Pneumonia
            ]
        );
    }

    #[test]
    fn test_missing_class_folder_is_config_error() {
        let root = TempDir::new().unwrap();
        write_images(&root.path().join("train/NORMAL"), 3);
        write_images(&root.path().join("test/NORMAL"), 1);
        write_images(&root.path().join("test/PNEUMONIA"), 1);

        let err = DatasetSplits::load(root.path(), &DataConfig::new()).unwrap_err();
        match err {
            PipelineError::MissingClassFolder { class, .. } => assert_eq!(class, "PNEUMONIA"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_root_is_reported() {
        let err = DatasetSplits::load(Path::new("/definitely/not/here"), &DataConfig::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingDirectory(_)));
    }

    #[test]
    fn test_non_image_files_are_skipped() {
        let root = make_root((2, 2), (1, 1));
        std::fs::write(root.path().join("train/NORMAL/notes.txt"), "x").unwrap();
        std::fs::write(root.path().join("train/NORMAL/scan.JPEG"), "not really").unwrap();
        let ds = XrayDataset::from_class_dirs(&root.path().join("train"), 16).unwrap();
        // the uppercase extension is listed; decoding problems surface later
        assert_eq!(ds.class_counts(), [3, 2]);
    }

    #[test]
    fn test_load_resized_uses_model_resolution() {
        let root = make_root((1, 1), (1, 1));
        let ds = XrayDataset::from_class_dirs(&root.path().join("test"), 12).unwrap();
        let (img, label) = ds.load_resized(1).unwrap();
        assert_eq!(img.dimensions(), (12, 12));
        assert_eq!(label, XrayLabel::Pneumonia);
    }

    #[test]
    fn test_class_weights_balance_counts() {
        let ds = XrayDataset {
            items: vec![
                (PathBuf::from("a"), XrayLabel::Normal),
                (PathBuf::from("b"), XrayLabel::Pneumonia),
                (PathBuf::from("c"), XrayLabel::Pneumonia),
                (PathBuf::from("d"), XrayLabel::Pneumonia),
            ],
            image_size: 8,
        };
        let w = class_weights(&ds);
        assert!((w[0] - 2.0).abs() < 1e-9);
        assert!((w[1] - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_split_fraction_rejected() {
        let config = DataConfig::new().with_validation_split(1.5);
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }
}
