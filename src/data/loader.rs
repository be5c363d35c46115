use std::sync::Arc;

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::data::{
    augmentation::Augmenter,
    batcher::XrayItem,
    dataset::{XrayDataset, XrayLabel},
};

/// Batch iterator over one split.
///
/// Training loaders reshuffle and re-augment on every epoch; evaluation
/// loaders keep the dataset order so predictions line up with labels.
pub struct XrayDataLoader {
    dataset: Arc<XrayDataset>,
    batch_size: usize,
    shuffle: bool,
    augmenter: Option<Augmenter>,
    rng: ChaCha8Rng,
}

impl XrayDataLoader {
    /// Ordered loader without augmentation.
    pub fn new(dataset: XrayDataset, batch_size: usize) -> Self {
        Self {
            dataset: Arc::new(dataset),
            batch_size: batch_size.max(1),
            shuffle: false,
            augmenter: None,
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    /// Reshuffle every epoch, seeded when `seed` is given.
    pub fn shuffled(mut self, seed: Option<u64>) -> Self {
        self.shuffle = true;
        self.rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        self
    }

    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        if augmenter.is_enabled() {
            self.augmenter = Some(augmenter);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn labels(&self) -> Vec<XrayLabel> {
        self.dataset.labels()
    }

    /// Index groups for one pass; the last group may be short.
    pub fn epoch_batches(&mut self) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }
        indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Decode, resize and (for training) augment the given samples.
    pub fn load_items(&mut self, indices: &[usize]) -> anyhow::Result<Vec<XrayItem>> {
        let mut items = Vec::with_capacity(indices.len());
        for &index in indices {
            let (image, label) = self
                .dataset
                .load_resized(index)
                .with_context(|| format!("loading sample {index}"))?;
            let image = match self.augmenter.as_mut() {
                Some(augmenter) => augmenter.augment(&image),
                None => image,
            };
            items.push(XrayItem::from_rgb(&image, label));
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dataset(n: usize) -> XrayDataset {
        XrayDataset {
            items: (0..n)
                .map(|i| {
                    let label = if i % 2 == 0 {
                        XrayLabel::Normal
                    } else {
                        XrayLabel::Pneumonia
                    };
                    (PathBuf::from(format!("{i}.png")), label)
                })
                .collect(),
            image_size: 8,
        }
    }

    #[test]
    fn test_ordered_loader_preserves_order() {
        let mut loader = XrayDataLoader::new(dataset(7), 3);
        let batches = loader.epoch_batches();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(loader.num_batches(), 3);
        // a second pass is identical
        assert_eq!(loader.epoch_batches(), batches);
    }

    #[test]
    fn test_shuffled_loader_covers_every_index() {
        let mut loader = XrayDataLoader::new(dataset(20), 6).shuffled(Some(3));
        let first: Vec<usize> = loader.epoch_batches().concat();
        let second: Vec<usize> = loader.epoch_batches().concat();

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_ne!(first, second, "each epoch draws a new permutation");
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let mut a = XrayDataLoader::new(dataset(10), 4).shuffled(Some(11));
        let mut b = XrayDataLoader::new(dataset(10), 4).shuffled(Some(11));
        assert_eq!(a.epoch_batches(), b.epoch_batches());
    }

    #[test]
    fn test_missing_file_surfaces_error() {
        let mut loader = XrayDataLoader::new(dataset(2), 2);
        assert!(loader.load_items(&[0]).is_err());
    }
}
