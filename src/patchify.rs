use image::{ImageBuffer, Pixel};
use ndarray::prelude::*;

use crate::config::{ChannelOrder, Config, ResizeFilter};
use crate::errors::{Result, ScanError};
use crate::resize::resize;

/// Fixed partition of a square image into non-overlapping square patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    pub image_size: u32,
    pub patch_size: u32,
    pub channels: u32,
}

impl PatchGrid {
    pub fn new(image_size: u32, patch_size: u32, channels: u32) -> Result<Self> {
        if image_size == 0 || patch_size == 0 || channels == 0 {
            return Err(ScanError::Validation {
                field: "patch grid".to_string(),
                reason: "sizes must be greater than zero".to_string(),
            });
        }
        if image_size % patch_size != 0 {
            return Err(ScanError::Validation {
                field: "patch_size".to_string(),
                reason: format!("{} does not divide image size {}", patch_size, image_size),
            });
        }
        Ok(Self {
            image_size,
            patch_size,
            channels,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.image_size, config.patch_size, config.num_channels)
    }

    /// Patches along one edge.
    pub const fn patches_per_side(&self) -> usize {
        (self.image_size / self.patch_size) as usize
    }

    pub const fn num_patches(&self) -> usize {
        self.patches_per_side() * self.patches_per_side()
    }

    /// Length of one flattened patch.
    pub const fn patch_dim(&self) -> usize {
        (self.patch_size * self.patch_size * self.channels) as usize
    }

    /// Shape of the encoded tensor without the batch axis.
    pub const fn tensor_shape(&self) -> (usize, usize) {
        (self.num_patches(), self.patch_dim())
    }
}

/// Output of [`PatchEncoder::encode`].
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// `(num_patches, patch_dim)`, patches row-major over the grid, each patch
    /// flattened as (row, column, channel).
    pub patches: Array2<f32>,
    /// Resized image scaled to [0, 1], `(height, width, channel)` in RGB order.
    pub normalized: Array3<f64>,
}

/// Turns a decoded raster into the flattened-patch tensor the segmentation
/// encoder was trained on.
#[derive(Debug, Clone, Copy)]
pub struct PatchEncoder {
    grid: PatchGrid,
    filter: ResizeFilter,
    channel_order: ChannelOrder,
}

impl PatchEncoder {
    pub const fn new(grid: PatchGrid, filter: ResizeFilter, channel_order: ChannelOrder) -> Self {
        Self {
            grid,
            filter,
            channel_order,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            PatchGrid::from_config(config)?,
            config.resize_filter,
            config.channel_order,
        ))
    }

    pub const fn grid(&self) -> PatchGrid {
        self.grid
    }

    pub fn encode<P>(&self, image: &ImageBuffer<P, Vec<u8>>) -> Result<EncodedImage>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let channels = usize::from(P::CHANNEL_COUNT);
        if channels != self.grid.channels as usize {
            return Err(ScanError::shape_mismatch(
                "patch encoder channels",
                vec![self.grid.channels as usize],
                vec![channels],
            ));
        }

        let size = self.grid.image_size;
        let resized = resize(image, size, size, self.filter)?;
        let side = size as usize;
        let pixels = Array3::from_shape_vec((side, side, channels), resized.into_raw())?;

        let normalized = pixels.mapv(|v| f64::from(v) / 255.0);
        let patches = self.patchify(&normalized)?;

        Ok(EncodedImage {
            patches,
            normalized,
        })
    }

    fn patchify(&self, normalized: &Array3<f64>) -> Result<Array2<f32>> {
        let ordered = match self.channel_order {
            ChannelOrder::Rgb => normalized.view(),
            ChannelOrder::Bgr => normalized.slice(s![.., .., ..;-1]),
        };

        let grid_side = self.grid.patches_per_side();
        let patch = self.grid.patch_size as usize;
        let channels = self.grid.channels as usize;

        let patches = Array1::from_iter(ordered.iter().map(|&v| v as f32))
            .into_shape_with_order((grid_side, patch, grid_side, patch, channels))?
            .permuted_axes([0, 2, 1, 3, 4])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order(self.grid.tensor_shape())?;

        Ok(patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn encoder(image_size: u32, patch_size: u32, order: ChannelOrder) -> PatchEncoder {
        PatchEncoder::new(
            PatchGrid::new(image_size, patch_size, 3).unwrap(),
            ResizeFilter::Nearest,
            order,
        )
    }

    #[test]
    fn test_grid_partition_is_area_preserving() {
        for (image_size, patch_size) in [(256, 16), (224, 14), (64, 8), (32, 32)] {
            let grid = PatchGrid::new(image_size, patch_size, 3).unwrap();
            assert_eq!(
                grid.num_patches() * (patch_size * patch_size) as usize,
                (image_size * image_size) as usize
            );
        }
    }

    #[test]
    fn test_grid_rejects_non_dividing_patch() {
        assert!(PatchGrid::new(256, 15, 3).is_err());
        assert!(PatchGrid::new(256, 0, 3).is_err());
    }

    #[test]
    fn test_encode_shape_for_arbitrary_input() -> Result<()> {
        let encoder = encoder(256, 16, ChannelOrder::Bgr);
        for (w, h) in [(256, 256), (100, 300), (512, 64)] {
            let image = RgbImage::from_pixel(w, h, Rgb([10, 20, 30]));
            let encoded = encoder.encode(&image)?;
            assert_eq!(encoded.patches.dim(), (256, 768));
            assert_eq!(encoded.normalized.dim(), (256, 256, 3));
        }
        Ok(())
    }

    #[test]
    fn test_values_are_scaled_to_unit_range() -> Result<()> {
        let encoder = encoder(4, 2, ChannelOrder::Rgb);
        let image = RgbImage::from_pixel(4, 4, Rgb([0, 51, 255]));
        let encoded = encoder.encode(&image)?;

        assert_eq!(encoded.patches[[0, 0]], 0.0);
        assert_eq!(encoded.patches[[0, 1]], 0.2);
        assert_eq!(encoded.patches[[0, 2]], 1.0);
        Ok(())
    }

    #[test]
    fn test_patch_layout_is_row_major() -> Result<()> {
        // 4x4 image, 2x2 patches. Red encodes x, green encodes y.
        let image = RgbImage::from_fn(4, 4, |x, y| Rgb([x as u8, y as u8, 0]));
        let encoded = encoder(4, 2, ChannelOrder::Rgb).encode(&image)?;
        let to_u8 = |v: f32| (v * 255.0).round() as u8;

        // Patch 1 is the top-right block; its first pixel is (x=2, y=0).
        assert_eq!(to_u8(encoded.patches[[1, 0]]), 2);
        assert_eq!(to_u8(encoded.patches[[1, 1]]), 0);
        // Patch 2 is the bottom-left block; its last pixel is (x=1, y=3).
        let last = 3 * 3;
        assert_eq!(to_u8(encoded.patches[[2, last]]), 1);
        assert_eq!(to_u8(encoded.patches[[2, last + 1]]), 3);
        // Second pixel of patch 0 is (x=1, y=0).
        assert_eq!(to_u8(encoded.patches[[0, 3]]), 1);
        Ok(())
    }

    #[test]
    fn test_bgr_order_swaps_channels_in_patches_only() -> Result<()> {
        let image = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        let encoded = encoder(4, 2, ChannelOrder::Bgr).encode(&image)?;

        assert_eq!(encoded.patches[[0, 0]], 0.0);
        assert_eq!(encoded.patches[[0, 2]], 1.0);
        assert_eq!(encoded.normalized[[0, 0, 0]], 1.0);
        Ok(())
    }

    #[test]
    fn test_default_filter_keeps_stripes_sharp() -> Result<()> {
        let config = Config {
            image_size: 32,
            patch_size: 8,
            ..Config::default()
        };
        let image = RgbImage::from_fn(64, 64, |x, _| {
            let v = if (x / 2) % 2 == 0 { 0 } else { 255 };
            Rgb([v, v, v])
        });
        let encoded = PatchEncoder::from_config(&config)?.encode(&image)?;

        assert_eq!(encoded.normalized[[5, 0, 0]], 0.0);
        assert_eq!(encoded.normalized[[5, 1, 0]], 1.0);
        assert!(encoded.patches.iter().all(|&v| v == 0.0 || v == 1.0));
        Ok(())
    }

    #[test]
    fn test_channel_count_mismatch() {
        let image = GrayImage::from_pixel(8, 8, Luma([0]));
        let err = encoder(4, 2, ChannelOrder::Rgb).encode(&image).unwrap_err();
        assert!(matches!(err, ScanError::ShapeMismatch { .. }));
    }
}
