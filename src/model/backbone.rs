//! VGG-style convolutional feature extractor.
//!
//! The backbone is a flat list of [`ConvBlock`]s grouped into stages; the
//! last block of every stage ends with a 2x2 max-pool. Freezing is tracked by
//! the owning model as a count of leading blocks, so this module only knows
//! how to run a contiguous range of blocks.

use std::ops::Range;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Convolutions per stage
    #[config(default = "vec![2, 2, 3, 3, 3]")]
    pub stages: Vec<usize>,
    /// Filters of the first stage, doubled at every following stage
    #[config(default = 64)]
    pub base_filters: usize,
    #[config(default = 512)]
    pub max_filters: usize,
    #[config(default = 3)]
    pub in_channels: usize,
}

impl BackboneConfig {
    /// Output channels of stage `stage` (0-based)
    pub fn stage_filters(&self, stage: usize) -> usize {
        let doubled = self.base_filters.saturating_mul(1usize << stage.min(16));
        doubled.min(self.max_filters)
    }

    pub fn out_channels(&self) -> usize {
        match self.stages.len() {
            0 => self.in_channels,
            n => self.stage_filters(n - 1),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut blocks = Vec::new();
        let mut in_channels = self.in_channels;

        for (stage, &convs) in self.stages.iter().enumerate() {
            let filters = self.stage_filters(stage);
            for index in 0..convs {
                let with_pool = index + 1 == convs;
                blocks.push(ConvBlock::new(
                    in_channels,
                    filters,
                    stage + 1,
                    index + 1,
                    with_pool,
                    device,
                ));
                in_channels = filters;
            }
        }

        Backbone { blocks }
    }
}

/// conv 3x3 (same padding) -> batch-norm -> ReLU, optionally followed by a
/// 2x2 max-pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
    /// 1-based stage number, used for layer names
    stage: usize,
    /// 1-based position inside the stage
    index: usize,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stage: usize,
        index: usize,
        with_pool: bool,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let bn = BatchNormConfig::new(out_channels).init(device);
        let pool = with_pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        Self {
            conv,
            bn,
            relu: Relu::new(),
            pool,
            stage,
            index,
        }
    }

    pub fn conv_name(&self) -> String {
        format!("block{}_conv{}", self.stage, self.index)
    }

    pub fn bn_name(&self) -> String {
        format!("block{}_bn{}", self.stage, self.index)
    }

    pub fn relu_name(&self) -> String {
        format!("block{}_relu{}", self.stage, self.index)
    }

    pub fn pool_name(&self) -> Option<String> {
        self.pool.as_ref().map(|_| format!("block{}_pool", self.stage))
    }

    pub fn out_channels(&self) -> usize {
        self.conv.weight.val().dims()[0]
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Activation after ReLU, before pooling.
    pub fn features(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }

    pub fn pool(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.features(x);
        self.pool(x)
    }

    /// Same as [`ConvBlock::features`] but batch-norm always uses the running
    /// statistics, whatever the backend. Needed when gradients are taken
    /// through a block that must still behave as in inference.
    pub fn features_inference(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = batch_norm_inference(&self.bn, x);
        self.relu.forward(x)
    }

    pub fn forward_inference(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.features_inference(x);
        self.pool(x)
    }
}

fn batch_norm_inference<B: Backend>(bn: &BatchNorm<B, 2>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    let channels = x.dims()[1];
    let shape = [1, channels, 1, 1];

    let mean = bn.running_mean.value().reshape(shape);
    let var = bn.running_var.value().reshape(shape);
    let gamma = bn.gamma.val().reshape(shape);
    let beta = bn.beta.val().reshape(shape);

    x.sub(mean)
        .div(var.add_scalar(bn.epsilon).sqrt())
        .mul(gamma)
        .add(beta)
}

#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_range(x, 0..self.blocks.len())
    }

    /// Run blocks `range` in order.
    pub fn forward_range(&self, x: Tensor<B, 4>, range: Range<usize>) -> Tensor<B, 4> {
        self.blocks[range]
            .iter()
            .fold(x, |x, block| block.forward(x))
    }

    pub fn forward_range_inference(&self, x: Tensor<B, 4>, range: Range<usize>) -> Tensor<B, 4> {
        self.blocks[range]
            .iter()
            .fold(x, |x, block| block.forward_inference(x))
    }

    /// Names of every convolution, in execution order
    pub fn conv_layer_names(&self) -> Vec<String> {
        self.blocks.iter().map(ConvBlock::conv_name).collect()
    }

    pub fn block_index(&self, conv_name: &str) -> Option<usize> {
        self.blocks
            .iter()
            .position(|block| block.conv_name() == conv_name)
    }

    /// Flat layer list: conv, bn, relu for every block plus the pool closing
    /// each stage. Every entry carries the index of the block it belongs to.
    pub fn layers(&self) -> Vec<(String, usize)> {
        let mut layers = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            layers.push((block.conv_name(), i));
            layers.push((block.bn_name(), i));
            layers.push((block.relu_name(), i));
            if let Some(pool) = block.pool_name() {
                layers.push((pool, i));
            }
        }
        layers
    }

    /// Index of the first block touched by the last `count` layers.
    ///
    /// A block counts as touched once its batch-norm is among those layers,
    /// so the boundary never leaves a block with a trainable convolution and
    /// a frozen normalization. Returns `len()` when nothing is touched.
    pub fn first_block_in_last_layers(&self, count: usize) -> usize {
        let layers = self.layers();
        let boundary = layers.len().saturating_sub(count);
        let mut position = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            // conv at `position`, bn right after it
            if position + 1 >= boundary && count > 0 {
                return i;
            }
            position += 3 + usize::from(block.has_pool());
        }
        self.blocks.len()
    }
}
