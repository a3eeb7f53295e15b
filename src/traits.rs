use crate::errors::Result;
use ndarray::prelude::*;

/// Forward pass of the patch-based segmentation encoder.
///
/// Implementations only run the network. Patchification, thresholding and
/// resizing live in the predictor so every backend shares one contract.
pub trait SegmentationModel: Send + Sync {
    /// `patches` has shape `(batch, num_patches, patch_dim)`. The returned
    /// array keeps the leading batch axis.
    fn forward(&self, patches: ArrayView3<f32>) -> Result<ArrayD<f32>>;
}

/// Forward pass of the image classifier.
pub trait ClassificationModel: Send + Sync {
    /// `images` is an NCHW batch; the result is `(batch, num_classes)` logits.
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array2<f32>>;

    /// Number of output classes when the model declares it statically.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}
