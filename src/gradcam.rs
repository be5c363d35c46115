//! Grad-CAM: class-discriminative heatmaps from a convolutional layer.
//!
//! Blocks before the target layer run on the inner backend; the target
//! activation is then re-entered into the autodiff graph as a leaf so the
//! gradient of the class score can be read back for it alone.

use std::path::Path;

use anyhow::Context;
use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    prelude::*,
    tensor::{activation::sigmoid, backend::AutodiffBackend},
};
use image::{imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};

use crate::{
    data::{load_rgb, XrayBatch, XrayBatcher, XrayItem, XrayLabel},
    error::PipelineError,
    model::PneumoniaModel,
};

pub const DEFAULT_ALPHA: f32 = 0.4;

#[derive(Debug, Clone)]
pub struct Heatmap {
    /// Row-major values in `[0, 1]`
    pub values: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl Heatmap {
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// Quantize to 8 bits and resize to `width` x `height`.
    pub fn resized(&self, width: u32, height: u32) -> GrayImage {
        let gray = GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let v = self.values[y as usize * self.width + x as usize];
            Luma([(v * 255.0).round().clamp(0.0, 255.0) as u8])
        });
        image::imageops::resize(&gray, width, height, FilterType::Triangle)
    }
}

#[derive(Debug, Clone)]
pub struct GradCamResult {
    pub heatmap: Heatmap,
    pub layer: String,
    pub probability: f32,
    pub predicted: XrayLabel,
}

/// Scale into `[0, 1]` by the maximum; everything stays zero when the
/// maximum is zero. Non-finite values count as zero.
pub fn normalize_in_place(values: &mut [f32]) {
    values
        .iter_mut()
        .filter(|v| !v.is_finite())
        .for_each(|v| *v = 0.0);
    let max = values.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        values.iter_mut().for_each(|v| *v = (*v / max).clamp(0.0, 1.0));
    } else {
        values.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Grad-CAM for a single preprocessed image `[1, 3, H, W]`.
pub fn compute<B: AutodiffBackend>(
    model: &PneumoniaModel<B>,
    image: Tensor<B, 4>,
    layer: &str,
    threshold: f32,
) -> anyhow::Result<GradCamResult> {
    let block = model
        .backbone
        .block_index(layer)
        .ok_or_else(|| PipelineError::UnknownLayer {
            name: layer.to_string(),
            available: model.backbone.conv_layer_names().join(", "),
        })?;

    let inference = model.valid();
    let prefix = inference
        .backbone
        .forward_range(image.inner(), 0..block);
    let features_inner = inference.backbone.blocks[block].features(prefix);
    let features = Tensor::<B, 4>::from_inner(features_inner.clone()).require_grad();

    let x = model.backbone.blocks[block].pool(features.clone());
    let x = model
        .backbone
        .forward_range_inference(x, block + 1..model.backbone.len());
    let logits = model.head.forward_inference(x);
    let probability = sigmoid(logits).reshape([1]);

    let p: f32 = probability.clone().into_scalar().elem();
    let predicted = XrayLabel::from_probability(p, threshold);
    let score = if predicted.is_positive() {
        probability
    } else {
        probability.neg().add_scalar(1.0)
    };

    let grads = score.sum().backward();
    let gradient = features
        .grad(&grads)
        .context("no gradient reached the target layer")?;

    // global-average-pooled gradients, one weight per channel
    let weights = gradient.mean_dim(3).mean_dim(2);
    let cam = features_inner.mul(weights).sum_dim(1).clamp_min(0.0);
    let [_, _, height, width] = cam.dims();

    let mut values: Vec<f32> = cam
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("Failed to read heatmap: {:?}", e))?;
    normalize_in_place(&mut values);

    Ok(GradCamResult {
        heatmap: Heatmap {
            values,
            height,
            width,
        },
        layer: layer.to_string(),
        probability: p,
        predicted,
    })
}

/// Jet colormap: blue at 0, green around 0.5, red at 1.
pub fn jet(t: f32) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0);
    let channel = |center: f32| {
        let v = (1.5 - (4.0 * t - center).abs()).clamp(0.0, 1.0);
        (v * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Blend the color-mapped heatmap over `original` with weight `alpha`.
pub fn overlay(original: &RgbImage, heatmap: &Heatmap, alpha: f32) -> RgbImage {
    let (width, height) = original.dimensions();
    let heat = heatmap.resized(width, height);

    RgbImage::from_fn(width, height, |x, y| {
        let color = jet(heat.get_pixel(x, y)[0] as f32 / 255.0);
        let base = original.get_pixel(x, y);
        let mut px = [0u8; 3];
        for (c, value) in px.iter_mut().enumerate() {
            let blended = alpha * color[c] as f32 + (1.0 - alpha) * base[c] as f32;
            *value = blended.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Load `image_path`, compute the heatmap for `layer` (last convolution when
/// `None`) and write the overlay as PNG to `output_path`.
pub fn explain_image<B: AutodiffBackend>(
    model: &PneumoniaModel<B>,
    image_path: &Path,
    layer: Option<&str>,
    image_size: usize,
    threshold: f32,
    output_path: &Path,
    device: &B::Device,
) -> anyhow::Result<GradCamResult> {
    let layer = match layer {
        Some(name) => name.to_string(),
        None => model
            .backbone
            .conv_layer_names()
            .pop()
            .context("the backbone has no convolution")?,
    };

    let original = load_rgb(image_path)?;
    let size = image_size as u32;
    let resized = image::imageops::resize(&original, size, size, FilterType::Triangle);
    // the label is a placeholder, only the image goes through the model
    let item = XrayItem::from_rgb(&resized, XrayLabel::Normal);
    let batch: XrayBatch<B> = XrayBatcher.batch(vec![item], device);

    let result = compute(model, batch.images, &layer, threshold)?;
    let blended = overlay(&original, &result.heatmap, DEFAULT_ALPHA);
    blended
        .save(output_path)
        .with_context(|| format!("writing {}", output_path.display()))?;

    log::info!(
        "Grad-CAM for {} at {}: predicted {} (p = {:.4}), overlay written to {}",
        image_path.display(),
        result.layer,
        result.predicted,
        result.probability,
        output_path.display()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackboneConfig, ModelConfig};
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = Autodiff<NdArray>;

    fn model() -> PneumoniaModel<TestBackend> {
        ModelConfig::new()
            .with_backbone(
                BackboneConfig::new()
                    .with_stages(vec![1, 2])
                    .with_base_filters(4)
                    .with_max_filters(8),
            )
            .with_head_units(4)
            .init(&NdArrayDevice::Cpu)
    }

    #[test]
    fn test_normalize_scales_by_max() {
        let mut values = vec![0.0, 1.0, 2.0, 4.0];
        normalize_in_place(&mut values);
        assert_eq!(values, vec![0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_normalize_all_zero_when_max_is_zero() {
        let mut values = vec![0.0; 6];
        normalize_in_place(&mut values);
        assert!(values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_normalize_zeroes_non_finite_values() {
        let mut values = vec![f32::NAN, 2.0, f32::INFINITY, 1.0];
        normalize_in_place(&mut values);
        assert_eq!(values, vec![0.0, 1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
    }

    #[test]
    fn test_overlay_keeps_original_size() {
        let original = RgbImage::from_pixel(30, 20, Rgb([100, 100, 100]));
        let heatmap = Heatmap {
            values: vec![0.0, 0.5, 1.0, 0.25],
            height: 2,
            width: 2,
        };
        let out = overlay(&original, &heatmap, DEFAULT_ALPHA);
        assert_eq!(out.dimensions(), (30, 20));
    }

    #[test]
    fn test_heatmap_in_unit_range_at_feature_resolution() {
        let device = NdArrayDevice::Cpu;
        let model = model();
        let image = Tensor::<TestBackend, 4>::random([1, 3, 16, 16], Distribution::Default, &device);

        let result = compute(&model, image, "block2_conv2", 0.5).unwrap();
        // stage 1 pools 16 -> 8; the target sits before stage 2's pool
        assert_eq!((result.heatmap.height, result.heatmap.width), (8, 8));
        assert_eq!(result.heatmap.values.len(), 64);
        assert!(result
            .heatmap
            .values
            .iter()
            .all(|v| (0.0..=1.0).contains(v)));
        let max = result.heatmap.max();
        assert!(max == 0.0 || (max - 1.0).abs() < 1e-6);
        assert!((0.0..=1.0).contains(&result.probability));
    }

    #[test]
    fn test_unknown_layer_is_rejected() {
        let device = NdArrayDevice::Cpu;
        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 8], &device);
        let err = compute(&model(), image, "dense", 0.5).unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::UnknownLayer { .. }));
    }

    #[test]
    fn test_explain_image_writes_png() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("xray.png");
        RgbImage::from_fn(24, 18, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 50]))
            .save(&input)
            .unwrap();
        let output = dir.path().join("gradcam_overlay.png");

        let result = explain_image(
            &model(),
            &input,
            None,
            16,
            0.5,
            &output,
            &NdArrayDevice::Cpu,
        )
        .unwrap();

        assert_eq!(result.layer, "block2_conv2");
        let written = image::open(&output).unwrap();
        assert_eq!((written.width(), written.height()), (24, 18));
    }
}
