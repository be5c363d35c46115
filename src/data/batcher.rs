use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::{Int, Shape, Tensor, TensorData},
};
use image::RgbImage;

use crate::data::dataset::XrayLabel;

/// One image in CHW layout, rescaled to [0, 1].
#[derive(Debug, Clone)]
pub struct XrayItem {
    pub image: Vec<f32>,
    pub label: XrayLabel,
    pub height: usize,
    pub width: usize,
}

impl XrayItem {
    pub fn from_rgb(img: &RgbImage, label: XrayLabel) -> Self {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let plane = height * width;
        let mut image = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            image[offset] = pixel[0] as f32 / 255.0;
            image[plane + offset] = pixel[1] as f32 / 255.0;
            image[2 * plane + offset] = pixel[2] as f32 / 255.0;
        }

        Self {
            image,
            label,
            height,
            width,
        }
    }
}

#[derive(Debug, Clone)]
pub struct XrayBatch<B: Backend> {
    /// `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch]`, 1 for pneumonia
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Debug, Clone, Default)]
pub struct XrayBatcher;

impl<B: Backend> Batcher<B, XrayItem, XrayBatch<B>> for XrayBatcher {
    fn batch(&self, items: Vec<XrayItem>, device: &B::Device) -> XrayBatch<B> {
        let batch_size = items.len();
        let (height, width) = items
            .first()
            .map(|item| (item.height, item.width))
            .unwrap_or((0, 0));

        let mut image_buffer = Vec::with_capacity(batch_size * 3 * height * width);
        let mut label_buffer = Vec::with_capacity(batch_size);
        for item in &items {
            image_buffer.extend_from_slice(&item.image);
            label_buffer.push(item.label.to_index() as i64);
        }

        let images = Tensor::from_data(
            TensorData::new(image_buffer, Shape::new([batch_size, 3, height, width])),
            device,
        );
        let targets = Tensor::from_data(
            TensorData::new(label_buffer, Shape::new([batch_size])),
            device,
        );

        XrayBatch { images, targets }
    }
}
