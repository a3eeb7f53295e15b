pub mod artifacts;
pub mod classification;
pub mod config;
pub mod errors;
pub mod model;
pub mod overlay;
pub mod patchify;
pub mod pipeline;
pub mod resize;
pub mod segmentation;
pub mod server;
pub mod traits;
pub mod weights;

pub mod mocks;

use tracing::{error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::classification::{ClassIndex, ClassificationPredictor};
use crate::model::{OnnxClassificationModel, OnnxSegmentationModel, SessionOptions};
use crate::patchify::PatchEncoder;
use crate::segmentation::SegmentationPredictor;

pub use config::Config;
pub use errors::{Result, ScanError};
pub use pipeline::{InferencePipeline, PredictionReport};
pub use server::{router, AppState};
pub use traits::*;

/// The pipeline served in production.
pub type OnnxPipeline = InferencePipeline<OnnxSegmentationModel, OnnxClassificationModel>;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Loads both models and the class index.
///
/// Only configuration errors are fatal. A model or class index that fails to
/// load leaves its predictor disabled and the server running degraded.
pub fn build_pipeline(config: &Config) -> Result<OnnxPipeline> {
    config.validate()?;

    let encoder = PatchEncoder::from_config(config)?;
    let grid = encoder.grid();
    let options = SessionOptions {
        device_id: config.device_id,
        intra_threads: config.intra_threads,
    };

    let segmenter = match OnnxSegmentationModel::new(&config.segmentation_model, grid, options) {
        Ok(model) => SegmentationPredictor::new(model, grid),
        Err(e) => {
            error!(error = ?e, path = %config.segmentation_model.display(), "segmentation model disabled");
            SegmentationPredictor::disabled(grid)
        }
    };

    let classifier = load_classifier(config, options);

    let mut artifacts = ArtifactStore::new(config.artifact_capacity);
    if let Some(path) = &config.mask_path {
        artifacts = artifacts.with_mask_path(path);
    }

    let pipeline = InferencePipeline::new(encoder, segmenter, classifier, artifacts);
    info!(
        segmentation = pipeline.segmentation_available(),
        classification = pipeline.classification_available(),
        classes = ?pipeline.classes().names(),
        "inference pipeline ready"
    );
    Ok(pipeline)
}

fn load_classifier(
    config: &Config,
    options: SessionOptions,
) -> ClassificationPredictor<OnnxClassificationModel> {
    let classes = match ClassIndex::from_directory(&config.class_dir) {
        Ok(classes) => classes,
        Err(e) => {
            error!(error = ?e, path = %config.class_dir.display(), "class index unavailable, classifier disabled");
            return ClassificationPredictor::disabled(ClassIndex::default());
        }
    };

    let model = match OnnxClassificationModel::new(
        &config.classifier_model,
        config.classifier_weights.as_deref(),
        options,
    ) {
        Ok(model) => model,
        Err(e) => {
            error!(error = ?e, path = %config.classifier_model.display(), "classifier disabled");
            return ClassificationPredictor::disabled(classes);
        }
    };

    match model.num_classes() {
        Some(n) if n != classes.len() => {
            warn!(
                model_classes = n,
                directory_classes = classes.len(),
                "classifier output does not match the class index, classifier disabled"
            );
            ClassificationPredictor::disabled(classes)
        }
        _ => ClassificationPredictor::new(model, classes),
    }
}
