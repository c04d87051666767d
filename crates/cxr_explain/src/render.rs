//! Heatmap colouring, overlays and PNG output.

use std::io::Cursor;

use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};

use crate::attribution::AttributionMap;
use crate::error::{ExplainError, Result};

/// Weight of the radiograph in an overlay.
pub const IMAGE_WEIGHT: f32 = 0.6;
/// Weight of the coloured heatmap in an overlay.
pub const HEATMAP_WEIGHT: f32 = 0.4;

const PANEL_GAP: u32 = 16;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const GRID_LINE: Rgb<u8> = Rgb([255, 255, 255]);

/// Jet colormap: dark blue at 0, through cyan, yellow, to dark red at 1.
///
/// The value is quantized to 256 levels first.
pub fn jet(value: f32) -> Rgb<u8> {
    let level = (value.clamp(0.0, 1.0) * 255.0) as u8;
    let v = f32::from(level) / 255.0;
    let channel = |center: f32| {
        let c = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Colour a map with [`jet`], scaled by its own minimum and maximum.
pub fn colorize(map: &AttributionMap) -> RgbImage {
    let [height, width] = map.shape();
    let (min, max) = (map.min(), map.max());
    let range = max - min;

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let value = map.get(y as usize, x as usize).unwrap_or(min);
        if range > 0.0 {
            jet((value - min) / range)
        } else {
            jet(0.0)
        }
    })
}

/// `0.6 · image + 0.4 · jet(heatmap)`.
///
/// # Errors
///
/// Fails if the heatmap and image sizes differ.
pub fn overlay(image: &RgbImage, heatmap: &AttributionMap) -> Result<RgbImage> {
    let [height, width] = heatmap.shape();
    if image.dimensions() != (width as u32, height as u32) {
        return Err(ExplainError::Render(format!(
            "heatmap is {width}×{height}, image is {}×{}",
            image.width(),
            image.height()
        )));
    }

    Ok(RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let base = image.get_pixel(x, y);
        let heat = jet(heatmap.get(y as usize, x as usize).unwrap_or(0.0));
        Rgb(std::array::from_fn(|c| {
            (IMAGE_WEIGHT * f32::from(base[c]) + HEATMAP_WEIGHT * f32::from(heat[c]))
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    }))
}

/// Attention grid scaled up to `side × side` with white cell borders.
pub fn attention_grid(map: &AttributionMap, side: u32) -> RgbImage {
    let [rows, cols] = map.shape();
    let mut grid = imageops::resize(&colorize(map), side, side, FilterType::Nearest);
    if rows == 0 || cols == 0 {
        return grid;
    }

    for i in 1..cols as u32 {
        let x = i * side / cols as u32;
        for y in 0..side {
            grid.put_pixel(x.min(side - 1), y, GRID_LINE);
        }
    }
    for j in 1..rows as u32 {
        let y = j * side / rows as u32;
        for x in 0..side {
            grid.put_pixel(x, y.min(side - 1), GRID_LINE);
        }
    }
    grid
}

/// Place two images next to each other on a white background.
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let width = left.width() + PANEL_GAP + right.width();
    let height = left.height().max(right.height());
    let mut panel = RgbImage::from_pixel(width, height, BACKGROUND);
    imageops::replace(&mut panel, left, 0, 0);
    imageops::replace(&mut panel, right, i64::from(left.width() + PANEL_GAP), 0);
    panel
}

/// Encode an image as PNG.
///
/// # Errors
///
/// Fails if the encoder does.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| ExplainError::Render(format!("Failed to encode PNG: {e}")))?;
    Ok(bytes)
}

/// Standard base64 of `bytes`.
pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// A rendered Grad-CAM explanation.
#[derive(Debug, Clone)]
pub struct Saliency {
    /// Normalized heatmap.
    pub heatmap: AttributionMap,
    /// Heatmap blended onto the radiograph.
    pub overlay: RgbImage,
    /// PNG of the radiograph beside the overlay.
    pub png: Vec<u8>,
}

impl Saliency {
    /// Render `heatmap` over `image`.
    ///
    /// # Errors
    ///
    /// Fails if the sizes differ or encoding fails.
    pub fn render(image: &RgbImage, heatmap: AttributionMap) -> Result<Self> {
        let overlay = overlay(image, &heatmap)?;
        let png = encode_png(&side_by_side(image, &overlay))?;
        Ok(Self {
            heatmap,
            overlay,
            png,
        })
    }
}

/// PNG of the radiograph beside its attention grid.
///
/// # Errors
///
/// Fails if encoding fails.
pub fn attention_panel(image: &RgbImage, attention: &AttributionMap) -> Result<Vec<u8>> {
    let grid = attention_grid(attention, image.height());
    encode_png(&side_by_side(image, &grid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::AttributionMethod;

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        // Green peaks in the middle.
        let mid = jet(0.5);
        assert!(mid[1] > 250);
        // Out-of-range values are clamped.
        assert_eq!(jet(-3.0), jet(0.0));
    }

    #[test]
    fn test_overlay_weights() {
        let image = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        let heatmap = AttributionMap::new(vec![0.0; 4], [2, 2], AttributionMethod::GradCam);

        let blended = overlay(&image, &heatmap).unwrap();
        // 0.6·100 + 0.4·(0, 0, 128)
        assert_eq!(*blended.get_pixel(1, 1), Rgb([60, 60, 111]));
    }

    #[test]
    fn test_overlay_size_mismatch() {
        let image = RgbImage::new(4, 4);
        let heatmap = AttributionMap::new(vec![0.0; 4], [2, 2], AttributionMethod::GradCam);
        assert!(matches!(overlay(&image, &heatmap), Err(ExplainError::Render(_))));
    }

    #[test]
    fn test_panel_png_decodes() {
        let image = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let heatmap = AttributionMap::new(
            (0..64).map(|i| i as f32 / 63.0).collect(),
            [8, 8],
            AttributionMethod::GradCam,
        );

        let saliency = Saliency::render(&image, heatmap).unwrap();
        let decoded = image::load_from_memory(&saliency.png).unwrap();
        assert_eq!(decoded.width(), 8 + PANEL_GAP + 8);
        assert_eq!(decoded.height(), 8);
        assert!(!to_base64(&saliency.png).is_empty());
    }

    #[test]
    fn test_attention_grid_lines() {
        let map = AttributionMap::new(vec![0.5; 4], [2, 2], AttributionMethod::Attention);
        let grid = attention_grid(&map, 10);
        assert_eq!(grid.dimensions(), (10, 10));
        assert_eq!(*grid.get_pixel(5, 2), GRID_LINE);
        assert_eq!(*grid.get_pixel(2, 2), jet(0.0));
    }
}
