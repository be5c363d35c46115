//! Random affine augmentation for training images.
//!
//! Every draw samples a rotation, translation, shear, zoom and flip, builds
//! one inverse affine map and resamples the image bilinearly, clamping source
//! coordinates to the nearest edge pixel.

use burn::config::Config;
use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{self, PipelineError};

#[derive(Config, Debug)]
pub struct AugmentationConfig {
    #[config(default = true)]
    pub enabled: bool,
    /// Max rotation in degrees, either direction
    #[config(default = 20.0)]
    pub rotation_degrees: f32,
    /// Max horizontal shift as a fraction of the width
    #[config(default = 0.2)]
    pub width_shift: f32,
    /// Max vertical shift as a fraction of the height
    #[config(default = 0.2)]
    pub height_shift: f32,
    /// Max shear angle in degrees
    #[config(default = 0.2)]
    pub shear_degrees: f32,
    /// Zoom factors are drawn from `[1 - zoom, 1 + zoom]` per axis
    #[config(default = 0.2)]
    pub zoom: f32,
    #[config(default = true)]
    pub horizontal_flip: bool,
}

impl AugmentationConfig {
    pub fn validate(&self) -> error::Result<()> {
        let ranges = [
            ("rotation_degrees", self.rotation_degrees),
            ("width_shift", self.width_shift),
            ("height_shift", self.height_shift),
            ("shear_degrees", self.shear_degrees),
            ("zoom", self.zoom),
        ];
        for (name, value) in ranges {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(PipelineError::Config(format!(
                    "augmentation {name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.zoom >= 1.0 {
            return Err(PipelineError::Config("augmentation zoom must be below 1".into()));
        }
        Ok(())
    }
}

/// One sampled set of transform parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub rotation: f32,
    pub shift_x: f32,
    pub shift_y: f32,
    pub shear: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
        }
    }

    /// Matrix mapping output pixel offsets (from the image center) to
    /// source offsets: rotation · shift · shear · zoom.
    fn matrix(&self) -> [[f32; 3]; 3] {
        let (sin_r, cos_r) = self.rotation.sin_cos();
        let rotation = [[cos_r, -sin_r, 0.0], [sin_r, cos_r, 0.0], [0.0, 0.0, 1.0]];
        let shift = [[1.0, 0.0, self.shift_x], [0.0, 1.0, self.shift_y], [0.0, 0.0, 1.0]];
        let (sin_s, cos_s) = self.shear.sin_cos();
        let shear = [[1.0, -sin_s, 0.0], [0.0, cos_s, 0.0], [0.0, 0.0, 1.0]];
        let zoom = [[self.zoom_x, 0.0, 0.0], [0.0, self.zoom_y, 0.0], [0.0, 0.0, 1.0]];

        matmul(matmul(matmul(rotation, shift), shear), zoom)
    }
}

fn matmul(a: [[f32; 3]; 3], b: [[f32; 3]; 3]) -> [[f32; 3]; 3] {
    let mut out = [[0.0f32; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Stateful augmenter: owns the RNG so a seed makes epochs reproducible.
pub struct Augmenter {
    config: AugmentationConfig,
    rng: ChaCha8Rng,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self { config, rng }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn sample(&mut self, width: u32, height: u32) -> AffineParams {
        let c = &self.config;
        let rotation = self
            .rng
            .random_range(-c.rotation_degrees..=c.rotation_degrees)
            .to_radians();
        let shift_x = self.rng.random_range(-c.width_shift..=c.width_shift) * width as f32;
        let shift_y = self.rng.random_range(-c.height_shift..=c.height_shift) * height as f32;
        let shear = self
            .rng
            .random_range(-c.shear_degrees..=c.shear_degrees)
            .to_radians();
        let zoom_x = self.rng.random_range(1.0 - c.zoom..=1.0 + c.zoom);
        let zoom_y = self.rng.random_range(1.0 - c.zoom..=1.0 + c.zoom);
        let flip = c.horizontal_flip && self.rng.random_bool(0.5);

        AffineParams {
            rotation,
            shift_x,
            shift_y,
            shear,
            zoom_x,
            zoom_y,
            flip,
        }
    }

    /// Draw fresh parameters and apply them; a disabled augmenter returns
    /// the input unchanged.
    pub fn augment(&mut self, image: &RgbImage) -> RgbImage {
        if !self.config.enabled {
            return image.clone();
        }
        let params = self.sample(image.width(), image.height());
        apply_affine(image, &params)
    }
}

/// Resample `image` through the inverse transform described by `params`.
pub fn apply_affine(image: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = image.dimensions();
    let m = params.matrix();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let mut out = RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = m[0][0] * dx + m[0][1] * dy + m[0][2] + cx;
        let sy = m[1][0] * dx + m[1][1] * dy + m[1][2] + cy;
        sample_bilinear(image, sx, sy)
    });

    if params.flip {
        image::imageops::flip_horizontal_in_place(&mut out);
    }
    out
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut px = [0u8; 3];
    for (c, value) in px.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(px)
}
