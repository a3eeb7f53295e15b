//! Raster resizing for the patch encoder.
//!
//! `ResizeFilter::Bilinear` is an OpenCV-compatible `INTER_LINEAR`: half-pixel
//! centres, two taps per axis, no antialiasing on downscale, 11-bit fixed-point
//! weights and a rounding shift. The other filters delegate to `imageops`.

use image::{imageops, imageops::FilterType, ImageBuffer, Pixel};

use crate::config::ResizeFilter;
use crate::errors::{Result, ScanError};

const COEF_BITS: u32 = 11;
const COEF_SCALE: f32 = (1 << COEF_BITS) as f32;
const ROUND_SHIFT: u32 = COEF_BITS * 2;
const ROUND_DELTA: i32 = 1 << (ROUND_SHIFT - 1);

/// Resizes an 8-bit raster with the given filter.
pub fn resize<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    width: u32,
    height: u32,
    filter: ResizeFilter,
) -> Result<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let filter = match filter {
        ResizeFilter::Bilinear => return resize_linear(image, width, height),
        ResizeFilter::Nearest => FilterType::Nearest,
        ResizeFilter::Triangle => FilterType::Triangle,
        ResizeFilter::Bicubic => FilterType::CatmullRom,
        ResizeFilter::Lanczos3 => FilterType::Lanczos3,
    };
    Ok(imageops::resize(image, width, height, filter))
}

/// One output coordinate: the two source samples and their fixed-point weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tap {
    index: usize,
    next: usize,
    weights: [i32; 2],
}

fn taps(src: u32, dst: u32) -> Vec<Tap> {
    let scale = 1.0 / (f64::from(dst) / f64::from(src));
    let last = src as usize - 1;
    (0..dst)
        .map(|d| {
            let position = ((f64::from(d) + 0.5) * scale - 0.5) as f32;
            let floor = position.floor();
            let (index, frac) = if floor < 0.0 {
                (0, 0.0)
            } else if floor as usize >= last {
                (last, 0.0)
            } else {
                (floor as usize, position - floor)
            };
            Tap {
                index,
                next: (index + 1).min(last),
                weights: [
                    ((1.0 - frac) * COEF_SCALE).round_ties_even() as i32,
                    (frac * COEF_SCALE).round_ties_even() as i32,
                ],
            }
        })
        .collect()
}

/// Separable fixed-point bilinear resize: a horizontal pass into `i32` rows
/// followed by a vertical pass with a 22-bit rounding shift.
pub fn resize_linear<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    width: u32,
    height: u32,
) -> Result<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8>,
{
    let (src_width, src_height) = image.dimensions();
    if (src_width, src_height) == (width, height) {
        return Ok(image.clone());
    }
    if src_width == 0 || src_height == 0 || width == 0 || height == 0 {
        return Ok(ImageBuffer::new(width, height));
    }

    let channels = usize::from(P::CHANNEL_COUNT);
    let row_len = src_width as usize * channels;
    let columns = taps(src_width, width);
    let rows = taps(src_height, height);

    let horizontal = image
        .as_raw()
        .chunks_exact(row_len)
        .map(|row| {
            columns
                .iter()
                .flat_map(|tap| {
                    (0..channels).map(move |c| {
                        i32::from(row[tap.index * channels + c]) * tap.weights[0]
                            + i32::from(row[tap.next * channels + c]) * tap.weights[1]
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let raw = rows
        .iter()
        .flat_map(|tap| {
            let (upper, lower) = (&horizontal[tap.index], &horizontal[tap.next]);
            upper.iter().zip(lower).map(move |(&a, &b)| {
                let value = (a * tap.weights[0] + b * tap.weights[1] + ROUND_DELTA) >> ROUND_SHIFT;
                value.clamp(0, 255) as u8
            })
        })
        .collect::<Vec<_>>();

    ImageBuffer::from_raw(width, height, raw).ok_or_else(|| {
        ScanError::shape_mismatch(
            "linear resize output",
            vec![height as usize, width as usize, channels],
            vec![],
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn stripes(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, _| Luma([if (x / 2) % 2 == 0 { 0 } else { 255 }]))
    }

    #[test]
    fn test_half_size_stripes_are_not_blurred() -> Result<()> {
        let resized = resize_linear(&stripes(512), 256, 256)?;

        let row = (0..6).map(|x| resized.get_pixel(x, 100)[0]).collect::<Vec<_>>();
        assert_eq!(row, vec![0, 255, 0, 255, 0, 255]);
        assert!(resized.pixels().all(|p| p[0] == 0 || p[0] == 255));
        Ok(())
    }

    #[test]
    fn test_downscale_rounds_half_up() -> Result<()> {
        // 2x average of (0, 100) is exactly 50; (200, 255) is 227.5 -> 228.
        let image = RgbImage::from_fn(4, 2, |x, _| {
            let v = [0, 100, 200, 255][x as usize];
            Rgb([v, 255 - v, 7])
        });
        let resized = resize_linear(&image, 2, 1)?;

        assert_eq!(resized.get_pixel(0, 0), &Rgb([50, 205, 7]));
        assert_eq!(resized.get_pixel(1, 0), &Rgb([228, 28, 7]));
        Ok(())
    }

    #[test]
    fn test_upscale_clamps_edges() -> Result<()> {
        let image = GrayImage::from_raw(2, 1, vec![0, 200]).unwrap();
        let resized = resize_linear(&image, 4, 1)?;
        assert_eq!(resized.into_raw(), vec![0, 50, 150, 200]);
        Ok(())
    }

    #[test]
    fn test_same_size_is_identity() -> Result<()> {
        let image = stripes(8);
        assert_eq!(resize_linear(&image, 8, 8)?, image);
        Ok(())
    }

    #[test]
    fn test_triangle_is_still_available() -> Result<()> {
        let resized = resize(&stripes(64), 32, 32, ResizeFilter::Triangle)?;
        assert_eq!(resized.dimensions(), (32, 32));
        assert!(resized.pixels().any(|p| p[0] != 0 && p[0] != 255));
        Ok(())
    }
}
