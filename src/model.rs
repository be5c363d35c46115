pub mod backbone;
pub mod summary;

use std::path::Path;

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    record::CompactRecorder,
    tensor::{activation::sigmoid, backend::AutodiffBackend, backend::Backend, Tensor},
};

pub use backbone::{Backbone, BackboneConfig, ConvBlock};

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
    /// Units of the hidden dense layer in the head
    #[config(default = 256)]
    pub head_units: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    /// Record file (CompactRecorder) holding pretrained backbone weights
    pub backbone_weights: Option<String>,
}

impl ModelConfig {
    /// Random weights everywhere, backbone fully frozen.
    pub fn init<B: Backend>(&self, device: &B::Device) -> PneumoniaModel<B> {
        let backbone = self.backbone.init(device);
        let head = ClassifierHead {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dense: LinearConfig::new(self.backbone.out_channels(), self.head_units).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.head_units, 1).init(device),
        };
        let frozen_blocks = backbone.len();

        PneumoniaModel {
            backbone,
            head,
            frozen_blocks,
        }
    }

    /// Build the model and load pretrained backbone weights when configured.
    pub fn build<B: Backend>(&self, device: &B::Device) -> anyhow::Result<PneumoniaModel<B>> {
        let mut model = self.init(device);
        match &self.backbone_weights {
            Some(path) => {
                log::info!("Loading pretrained backbone weights from {path}");
                model.backbone = model
                    .backbone
                    .load_file(Path::new(path), &CompactRecorder::new(), device)
                    .map_err(|e| anyhow::anyhow!("Failed to load backbone weights: {:?}", e))?;
            }
            None => log::warn!(
                "No pretrained backbone weights configured; the frozen backbone keeps its random initialisation"
            ),
        }
        Ok(model)
    }
}

/// Global average pooling -> dense + ReLU -> dropout -> single logit.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub pool: AdaptiveAvgPool2d,
    pub dense: Linear<B>,
    pub relu: Relu,
    pub dropout: Dropout,
    pub output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    fn pooled(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        // [B, C, H, W] -> [B, C, 1, 1] -> [B, C]
        let x = self.pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }

    /// Logits `[batch, 1]`. Dropout is only active on autodiff backends.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pooled(x);
        let x = self.relu.forward(self.dense.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    /// Logits without dropout, whatever the backend.
    pub fn forward_inference(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pooled(x);
        let x = self.relu.forward(self.dense.forward(x));
        self.output.forward(x)
    }
}

/// Backbone + head. The first `frozen_blocks` backbone blocks are frozen:
/// during training they run on the inner backend, so they receive no
/// gradients and their batch-norms keep using running statistics.
#[derive(Module, Debug)]
pub struct PneumoniaModel<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: ClassifierHead<B>,
    frozen_blocks: usize,
}

impl<B: Backend> PneumoniaModel<B> {
    /// Inference forward pass, logits `[batch, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images);
        self.head.forward(x)
    }

    /// Pneumonia probability per image, `[batch]`.
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 1> {
        let logits = self.forward(images);
        let [batch_size, _] = logits.dims();
        sigmoid(logits.reshape([batch_size]))
    }

    pub fn frozen_blocks(&self) -> usize {
        self.frozen_blocks
    }

    pub fn is_block_trainable(&self, block: usize) -> bool {
        block >= self.frozen_blocks
    }

    pub fn freeze_backbone(mut self) -> Self {
        self.frozen_blocks = self.backbone.len();
        self
    }

    /// Unfreeze the backbone blocks covered by its last `layers` layers.
    pub fn unfreeze_last_layers(mut self, layers: usize) -> Self {
        self.frozen_blocks = self.backbone.first_block_in_last_layers(layers);
        self
    }

    /// Parameter counts split as `(trainable, frozen)`.
    pub fn parameter_counts(&self) -> (usize, usize) {
        let mut trainable = self.head.num_params();
        let mut frozen = 0;
        for (i, block) in self.backbone.blocks.iter().enumerate() {
            if self.is_block_trainable(i) {
                trainable += block.num_params();
            } else {
                frozen += block.num_params();
            }
        }
        (trainable, frozen)
    }
}

impl<B: AutodiffBackend> PneumoniaModel<B> {
    /// Training forward pass: frozen blocks are evaluated outside the graph.
    pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let split = self.frozen_blocks.min(self.backbone.len());
        let x = if split > 0 {
            let mut inner = images.inner();
            for block in &self.backbone.blocks[..split] {
                inner = block.clone().valid().forward(inner);
            }
            Tensor::from_inner(inner)
        } else {
            images
        };
        let x = self.backbone.forward_range(x, split..self.backbone.len());
        self.head.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn tiny_config() -> ModelConfig {
        ModelConfig::new()
            .with_backbone(
                BackboneConfig::new()
                    .with_stages(vec![1, 1])
                    .with_base_filters(4)
                    .with_max_filters(8),
            )
            .with_head_units(6)
    }

    #[test]
    fn test_probabilities_are_in_unit_interval() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([3, 3, 8, 8], Distribution::Default, &device);
        let probs: Vec<f32> = model.probabilities(images).into_data().to_vec().unwrap();
        assert_eq!(probs.len(), 3);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_backbone_starts_frozen() {
        let model = tiny_config().init::<TestBackend>(&NdArrayDevice::Cpu);
        assert_eq!(model.frozen_blocks(), 2);
        let (trainable, frozen) = model.parameter_counts();
        assert_eq!(trainable, model.head.num_params());
        assert_eq!(frozen, model.backbone.num_params());
    }

    #[test]
    fn test_frozen_blocks_receive_no_gradients() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config().init::<TestAutodiffBackend>(&device);
        let images =
            Tensor::<TestAutodiffBackend, 4>::random([2, 3, 8, 8], Distribution::Default, &device);

        let grads = model.forward_train(images).sum().backward();

        let frozen_weight = &model.backbone.blocks[0].conv.weight;
        assert!(frozen_weight.val().grad(&grads).is_none());
        assert!(model.head.dense.weight.val().grad(&grads).is_some());
    }

    #[test]
    fn test_unfrozen_blocks_receive_gradients() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config()
            .init::<TestAutodiffBackend>(&device)
            .unfreeze_last_layers(4);
        // layers: conv, bn, relu, pool | conv, bn, relu, pool
        assert_eq!(model.frozen_blocks(), 1);

        let images =
            Tensor::<TestAutodiffBackend, 4>::random([2, 3, 8, 8], Distribution::Default, &device);
        let grads = model.forward_train(images).sum().backward();

        assert!(model.backbone.blocks[0].conv.weight.val().grad(&grads).is_none());
        assert!(model.backbone.blocks[1].conv.weight.val().grad(&grads).is_some());
    }

    #[test]
    fn test_record_snapshot_keeps_batch_norm_statistics() {
        let device = NdArrayDevice::Cpu;
        let model = tiny_config()
            .init::<TestAutodiffBackend>(&device)
            .unfreeze_last_layers(100);
        let snapshot = model.clone().into_record();

        let images =
            Tensor::<TestAutodiffBackend, 4>::random([2, 3, 8, 8], Distribution::Default, &device);
        let _ = model.forward_train(images);

        let updated = model.backbone.blocks[0].bn.running_mean.value();

        let restored = tiny_config()
            .init::<TestAutodiffBackend>(&device)
            .load_record(snapshot);
        let kept: Vec<f32> = restored.backbone.blocks[0]
            .bn
            .running_mean
            .value()
            .into_data()
            .to_vec()
            .unwrap();
        assert!(kept.iter().all(|v| *v == 0.0));
        let moved: Vec<f32> = updated.into_data().to_vec().unwrap();
        assert!(moved.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_freeze_flags_survive_valid() {
        let model = tiny_config()
            .init::<TestAutodiffBackend>(&NdArrayDevice::Cpu)
            .unfreeze_last_layers(100);
        assert_eq!(model.valid().frozen_blocks(), 0);
    }
}
