use std::io::Cursor;

use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use imageproc::map::map_colors2;
use ndarray::prelude::*;

use crate::errors::{Result, ScanError};

pub const IMAGE_WEIGHT: f32 = 1.0;
pub const MASK_WEIGHT: f32 = 0.5;

/// Blends a binary mask, drawn into the green channel, over a normalized RGB
/// image.
///
/// `normalized` is `(height, width, 3)` in [0, 1]; `mask` is `(height, width)`
/// with values 0.0 or 1.0. Both are brought to 8 bits by truncating
/// `value * 255`, then combined as `round(image * 1.0 + colour_mask * 0.5)`
/// with ties to even and saturation at 255.
pub fn render_overlay(normalized: ArrayView3<f64>, mask: ArrayView2<f32>) -> Result<RgbImage> {
    let (height, width, channels) = normalized.dim();
    if channels != 3 || mask.dim() != (height, width) {
        return Err(ScanError::shape_mismatch(
            "overlay inputs",
            vec![height, width, 3],
            vec![mask.nrows(), mask.ncols(), channels],
        ));
    }

    let image = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([0, 1, 2].map(|c| (normalized[[y, x, c]] * 255.0) as u8))
    });
    let mask = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([(mask[[y as usize, x as usize]] * 255.0) as u8])
    });

    Ok(map_colors2(&image, &mask, |Rgb([r, g, b]): Rgb<u8>, Luma([m]): Luma<u8>| {
        Rgb([blend(r, 0), blend(g, m), blend(b, 0)])
    }))
}

fn blend(image: u8, mask: u8) -> u8 {
    let value = f32::from(image) * IMAGE_WEIGHT + f32::from(mask) * MASK_WEIGHT;
    value.round_ties_even().clamp(0.0, 255.0) as u8
}

/// PNG bytes of an overlay, as served by the mask endpoints.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| ScanError::ImageProcessing {
            operation: "overlay PNG encoding".to_string(),
            source: Box::new(e),
        })?;
    Ok(buffer.into_inner())
}
