use image::{imageops, imageops::FilterType, ImageBuffer, Luma};
use ndarray::prelude::*;

use crate::errors::{ModelKind, Result, ScanError};
use crate::patchify::PatchGrid;
use crate::traits::SegmentationModel;

pub const MASK_THRESHOLD: f32 = 0.5;

/// Binary segmentation mask, every value is exactly 0.0 or 1.0.
pub type Mask = Array2<f32>;

/// Runs the segmentation encoder over a patch tensor and turns its output map
/// into a binary mask at the grid resolution.
pub struct SegmentationPredictor<M: SegmentationModel> {
    model: Option<M>,
    grid: PatchGrid,
}

impl<M: SegmentationModel> SegmentationPredictor<M> {
    pub const fn new(model: M, grid: PatchGrid) -> Self {
        Self {
            model: Some(model),
            grid,
        }
    }

    /// Predictor for a model that failed to load; every call reports
    /// `UnavailableModel`.
    pub const fn disabled(grid: PatchGrid) -> Self {
        Self { model: None, grid }
    }

    pub const fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn segment(&self, patches: ArrayView2<f32>) -> Result<Mask> {
        let model = self.model.as_ref().ok_or(ScanError::UnavailableModel {
            model: ModelKind::Segmentation,
        })?;

        let (num_patches, patch_dim) = self.grid.tensor_shape();
        if patches.dim() != (num_patches, patch_dim) {
            return Err(ScanError::shape_mismatch(
                "segmentation input",
                vec![num_patches, patch_dim],
                patches.shape().to_vec(),
            ));
        }

        let output = model.forward(patches.insert_axis(Axis(0)))?;
        let first = first_batch_element(output)?;
        let map = output_map(first)?;
        Ok(threshold(resize_map(map, self.grid.image_size)?))
    }
}

fn first_batch_element(output: ArrayD<f32>) -> Result<ArrayD<f32>> {
    if output.ndim() == 0 || output.shape()[0] == 0 {
        return Err(ScanError::shape_mismatch(
            "segmentation output batch",
            vec![1],
            output.shape().to_vec(),
        ));
    }
    Ok(output.index_axis_move(Axis(0), 0))
}

/// Interprets one output element as a 2D map: a trailing unit channel is
/// dropped and a 1D output becomes a single column.
fn output_map(element: ArrayD<f32>) -> Result<Array2<f32>> {
    let shape = element.shape().to_vec();
    if shape.contains(&0) {
        return Err(ScanError::shape_mismatch(
            "segmentation output map",
            vec![1, 1],
            shape,
        ));
    }
    let map = match shape.as_slice() {
        [rows] => element.into_shape_with_order((*rows, 1))?,
        [_, _] => element.into_dimensionality::<Ix2>()?,
        [_, _, 1] => element
            .index_axis_move(Axis(2), 0)
            .into_dimensionality::<Ix2>()?,
        _ => {
            return Err(ScanError::shape_mismatch(
                "segmentation output map",
                vec![0, 0, 1],
                shape,
            ))
        }
    };
    Ok(map)
}

/// Bilinear resize of the raw output map to `size x size`.
fn resize_map(map: Array2<f32>, size: u32) -> Result<Array2<f32>> {
    let (rows, cols) = map.dim();
    let raw = map.iter().copied().collect::<Vec<_>>();
    let image = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(cols as u32, rows as u32, raw)
        .ok_or_else(|| {
            ScanError::shape_mismatch("segmentation output map", vec![rows, cols], vec![])
        })?;
    let resized = imageops::resize(&image, size, size, FilterType::Triangle);
    Ok(Array2::from_shape_vec(
        (size as usize, size as usize),
        resized.into_raw(),
    )?)
}

fn threshold(map: Array2<f32>) -> Mask {
    map.mapv(|v| if v > MASK_THRESHOLD { 1.0 } else { 0.0 })
}
