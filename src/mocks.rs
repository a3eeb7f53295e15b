//! In-process model doubles for tests and for exercising the server without
//! ONNX files.

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use ndarray::prelude::*;

use crate::classification::ClassIndex;
use crate::errors::{Result, ScanError};
use crate::traits::{ClassificationModel, SegmentationModel};

/// Segmentation double that ignores its input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockSegmentationModel {
    /// Every patch gets the same probability.
    Constant(f32),
    /// Probability grows linearly from 0 for the first patch to 1 for the last.
    Gradient,
}

impl MockSegmentationModel {
    pub const fn constant(probability: f32) -> Self {
        Self::Constant(probability)
    }

    pub const fn gradient() -> Self {
        Self::Gradient
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn forward(&self, patches: ArrayView3<f32>) -> Result<ArrayD<f32>> {
        let (batch, num_patches, _) = patches.dim();
        let last = num_patches.saturating_sub(1).max(1) as f32;
        let output = Array3::from_shape_fn((batch, num_patches, 1), |(_, i, _)| match self {
            Self::Constant(p) => *p,
            Self::Gradient => i as f32 / last,
        });
        Ok(output.into_dyn())
    }
}

/// Segmentation double whose forward pass always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSegmentationModel;

impl SegmentationModel for FailingSegmentationModel {
    fn forward(&self, _patches: ArrayView3<f32>) -> Result<ArrayD<f32>> {
        Err(ScanError::Model {
            operation: "mock segmentation forward".to_string(),
            source: "forward pass rejected".into(),
        })
    }
}

/// Classifier double returning the same logits for every image.
#[derive(Debug, Clone, PartialEq)]
pub struct MockClassificationModel {
    logits: Vec<f32>,
}

impl MockClassificationModel {
    pub const fn new(logits: Vec<f32>) -> Self {
        Self { logits }
    }
}

impl ClassificationModel for MockClassificationModel {
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let batch = images.dim().0;
        let row = ArrayView1::from(&self.logits);
        Ok(Array2::from_shape_fn((batch, self.logits.len()), |(_, j)| {
            row[j]
        }))
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.logits.len())
    }
}

/// The four classes of the brain MRI training set, in directory order.
pub fn test_classes() -> ClassIndex {
    ClassIndex::new(
        ["glioma", "meningioma", "notumor", "pituitary"]
            .map(String::from)
            .to_vec(),
    )
    .unwrap_or_default()
}

/// JPEG-encoded diagonal gradient of the given size.
pub fn jpeg_bytes(width: u32, height: u32) -> Result<Vec<u8>> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let v = ((x + y) * 255 / (width + height).max(1)) as u8;
        Rgb([v, 255 - v, v / 2])
    });
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, ImageFormat::Jpeg)
        .map_err(|e| ScanError::ImageProcessing {
            operation: "test fixture JPEG encoding".to_string(),
            source: Box::new(e),
        })?;
    Ok(bytes.into_inner())
}
