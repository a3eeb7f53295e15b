use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, ImageReader, Limits, RgbImage};
use tracing::{debug, debug_span};

use crate::artifacts::{ArtifactStore, OverlayArtifact};
use crate::classification::{ClassIndex, Classification, ClassificationPredictor};
use crate::errors::{DecodeStage, Result, ScanError};
use crate::overlay::{encode_png, render_overlay};
use crate::patchify::PatchEncoder;
use crate::segmentation::SegmentationPredictor;
use crate::traits::{ClassificationModel, SegmentationModel};

/// Lifecycle of one prediction request. Any failure ends in `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    Decoded,
    SegmentationDone,
    OverlayWritten,
    ClassificationDone,
    Responded,
    Rejected,
}

/// The two representations every upload is decoded into.
#[derive(Debug, Clone)]
pub struct DecodedUpload {
    /// 8-bit RGB raster for the patch encoder.
    pub raster: RgbImage,
    /// Decoded image object for the classifier.
    pub image: DynamicImage,
}

/// Largest width or height the classifier decode accepts.
pub const MAX_IMAGE_SIDE: u32 = 16_384;

/// Decodes the same bytes twice; the primary failure is reported first.
///
/// The secondary decode runs under [`MAX_IMAGE_SIDE`] limits, so an image the
/// raster path accepts can still be rejected there as an invalid format.
pub fn decode_upload(bytes: &[u8]) -> Result<DecodedUpload> {
    let raster = image::load_from_memory(bytes)
        .map_err(|e| ScanError::Decode {
            stage: DecodeStage::Primary,
            source: Box::new(e),
        })?
        .into_rgb8();

    let secondary = |e: image::ImageError| ScanError::Decode {
        stage: DecodeStage::Secondary,
        source: Box::new(e),
    };
    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| secondary(image::ImageError::IoError(e)))?;
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_SIDE);
    limits.max_image_height = Some(MAX_IMAGE_SIDE);
    reader.limits(limits);
    let image = reader.decode().map_err(secondary)?;

    Ok(DecodedUpload { raster, image })
}

/// Successful outcome of [`InferencePipeline::predict`].
#[derive(Debug, Clone)]
pub struct PredictionReport {
    pub classification: Classification,
    pub overlay: Arc<OverlayArtifact>,
}

/// Immutable per-process context: both predictors, the patch encoder and the
/// overlay store. Built once at startup and shared by every request.
pub struct InferencePipeline<S: SegmentationModel, C: ClassificationModel> {
    encoder: PatchEncoder,
    segmenter: SegmentationPredictor<S>,
    classifier: ClassificationPredictor<C>,
    artifacts: ArtifactStore,
}

impl<S: SegmentationModel, C: ClassificationModel> InferencePipeline<S, C> {
    pub const fn new(
        encoder: PatchEncoder,
        segmenter: SegmentationPredictor<S>,
        classifier: ClassificationPredictor<C>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            encoder,
            segmenter,
            classifier,
            artifacts,
        }
    }

    pub const fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub const fn classes(&self) -> &ClassIndex {
        self.classifier.classes()
    }

    pub const fn segmentation_available(&self) -> bool {
        self.segmenter.is_available()
    }

    pub const fn classification_available(&self) -> bool {
        self.classifier.is_available()
    }

    /// Runs one upload through both models and stores the overlay.
    ///
    /// The forward passes run concurrently; their results are committed in
    /// stage order, so a segmentation failure wins over a classification
    /// failure and a failed classification still leaves the overlay stored.
    pub fn predict(&self, bytes: &[u8]) -> Result<PredictionReport> {
        let span = debug_span!("predict", bytes = bytes.len());
        let _guard = span.enter();
        stage(RequestStage::Received);

        let upload = decode_upload(bytes)?;
        stage(RequestStage::Decoded);

        let (overlay, classification) = rayon::join(
            || self.segment_overlay(&upload.raster),
            || self.classifier.classify(&upload.image),
        );

        let overlay = overlay?;
        stage(RequestStage::SegmentationDone);

        let overlay = self.artifacts.insert(OverlayArtifact::new(overlay))?;
        stage(RequestStage::OverlayWritten);

        let classification = classification?;
        stage(RequestStage::ClassificationDone);

        debug!(
            id = %overlay.id,
            label = %classification.label,
            confidence = classification.confidence,
            "prediction complete"
        );
        Ok(PredictionReport {
            classification,
            overlay,
        })
    }

    fn segment_overlay(&self, raster: &RgbImage) -> Result<Vec<u8>> {
        let encoded = self.encoder.encode(raster)?;
        let mask = self.segmenter.segment(encoded.patches.view())?;
        let overlay = render_overlay(encoded.normalized.view(), mask.view())?;
        encode_png(&overlay)
    }
}

fn stage(stage: RequestStage) {
    debug!(?stage, "request stage");
}
