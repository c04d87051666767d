//! Radiograph preprocessing.
//!
//! Images are converted to RGB, resized to a square input, scaled to
//! `[0, 1]` and normalized per channel with the ImageNet statistics the
//! backbones were pretrained with.

use std::path::Path;

use burn::prelude::*;
use cxr_core::ImageShape;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use tracing::debug;

use crate::error::{DataError, Result};

/// Per-channel mean of the pretraining data.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the pretraining data.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Image to tensor conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    size: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(224)
    }
}

impl Preprocessor {
    /// Preprocessor producing `size × size` inputs.
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    /// Output side length.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Shape of a preprocessed single image.
    pub fn shape(&self) -> ImageShape {
        ImageShape::single(self.size as usize)
    }

    /// Decode an image file.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing or cannot be decoded.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<DynamicImage> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DataError::NotFound(path.to_path_buf()));
        }
        image::open(path).map_err(|e| DataError::Image(format!("{}: {e}", path.display())))
    }

    /// Decode image bytes.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a supported image.
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory(bytes).map_err(|e| DataError::Image(e.to_string()))
    }

    /// RGB conversion and bilinear resize.
    pub fn resize(&self, image: &DynamicImage) -> RgbImage {
        let rgb = image.to_rgb8();
        if rgb.dimensions() == (self.size, self.size) {
            return rgb;
        }
        imageops::resize(&rgb, self.size, self.size, FilterType::Triangle)
    }

    /// Normalized `[3, size, size]` values in channel-major order.
    pub fn normalize(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut values = vec![0.0; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                values[c * plane + offset] =
                    (f32::from(pixel[c]) / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        values
    }

    /// Preprocess a decoded image into a `[1, 3, size, size]` tensor.
    pub fn to_tensor<B: Backend>(&self, image: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
        let resized = self.resize(image);
        let size = self.size as usize;
        debug!(
            original = ?(image.width(), image.height()),
            size,
            "preprocessed radiograph"
        );
        Tensor::from_data(
            TensorData::new(self.normalize(&resized), [1, 3, size, size]),
            device,
        )
    }

    /// Load and preprocess an image file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or decoded.
    pub fn load<B: Backend>(&self, path: impl AsRef<Path>, device: &B::Device) -> Result<Tensor<B, 4>> {
        Ok(self.to_tensor(&self.open(path)?, device))
    }
}

/// Undo normalization of the first image of a batch for display.
///
/// Values are clipped to `[0, 1]` before conversion to 8 bits.
///
/// # Errors
///
/// Fails unless `images` is `[batch, 3, H, W]`.
pub fn to_display_image<B: Backend>(images: Tensor<B, 4>) -> Result<RgbImage> {
    let [batch, channels, height, width] = images.dims();
    if batch == 0 {
        return Err(DataError::InvalidShape("empty batch".to_string()));
    }
    ImageShape::new(batch, 3, height, width).check(&[batch, channels, height, width])?;

    let first = images.slice([0..1, 0..3, 0..height, 0..width]);
    let values: Vec<f32> = first.into_data().iter::<f32>().collect();
    let plane = height * width;

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let offset = y as usize * width + x as usize;
        Rgb(std::array::from_fn(|c| {
            let value = values[c * plane + offset] * IMAGENET_STD[c] + IMAGENET_MEAN[c];
            (value.clamp(0.0, 1.0) * 255.0).round() as u8
        }))
    }))
}
