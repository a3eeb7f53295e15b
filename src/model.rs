use std::borrow::Cow;
use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::classification::INPUT_SIZE;
use crate::errors::{Result, ScanError};
use crate::patchify::PatchGrid;
use crate::traits::{ClassificationModel, SegmentationModel};
use crate::weights::{migrate, Checkpoint, ParameterSpec};

/// Runtime knobs shared by both ONNX sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub device_id: i32,
    pub intra_threads: Option<usize>,
}

fn build_session(model_path: &Path, options: SessionOptions) -> Result<Session> {
    let mut builder = SessionBuilder::new()
        .map_err(|e| ScanError::model("session builder initialization", e))?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(options.device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(options.device_id)
                .build(),
        ])
        .map_err(|e| ScanError::model("execution provider registration", e))?
        .with_memory_pattern(true)
        .map_err(|e| ScanError::model("memory pattern configuration", e))?;

    if let Some(threads) = options.intra_threads {
        builder = builder
            .with_intra_threads(threads)
            .map_err(|e| ScanError::model("intra-op thread configuration", e))?;
    }

    builder
        .commit_from_file(model_path)
        .map_err(|e| ScanError::model(format!("model load: {}", model_path.display()), e))
}

/// Declared dimensions of a session input or output; unknown sizes are
/// negative.
fn declared_shape(value_type: &ort::value::ValueType) -> Option<Vec<i64>> {
    value_type
        .tensor_shape()
        .map(|shape| shape.iter().copied().collect())
}

/// Fails if a declared static dimension disagrees with `expected`.
fn check_declared(context: &str, declared: Option<Vec<i64>>, expected: &[usize]) -> Result<()> {
    let Some(declared) = declared else {
        return Ok(());
    };
    let compatible = declared.len() == expected.len()
        && declared
            .iter()
            .zip(expected)
            .all(|(&d, &e)| d < 0 || d as usize == e);
    if compatible {
        Ok(())
    } else {
        Err(ScanError::shape_mismatch(
            context,
            expected.to_vec(),
            declared.iter().map(|&d| d.max(0) as usize).collect::<Vec<_>>(),
        ))
    }
}

fn io_names(session: &Session) -> Result<(String, String)> {
    let input = session.inputs.first().ok_or_else(|| ScanError::Validation {
        field: "model inputs".to_string(),
        reason: "model declares no inputs".to_string(),
    })?;
    let output = session.outputs.first().ok_or_else(|| ScanError::Validation {
        field: "model outputs".to_string(),
        reason: "model declares no outputs".to_string(),
    })?;
    Ok((input.name.clone(), output.name.clone()))
}

/// Segmentation encoder backed by an ONNX Runtime session. Expects input
/// `(batch, num_patches, patch_dim)`.
pub struct OnnxSegmentationModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxSegmentationModel {
    pub fn new(model_path: &Path, grid: PatchGrid, options: SessionOptions) -> Result<Self> {
        let session = build_session(model_path, options)?;
        let (input_name, output_name) = io_names(&session)?;

        let (num_patches, patch_dim) = grid.tensor_shape();
        check_declared(
            "segmentation model input",
            declared_shape(&session.inputs[0].input_type),
            &[1, num_patches, patch_dim],
        )?;

        let model = Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        };

        // initialize model
        let data = Array3::<f32>::zeros((1, num_patches, patch_dim));
        let output = model.forward(data.view())?;
        info!(
            path = %model_path.display(),
            input = %model.input_name,
            output_shape = ?output.shape(),
            "segmentation model loaded"
        );

        Ok(model)
    }
}

impl SegmentationModel for OnnxSegmentationModel {
    fn forward(&self, patches: ArrayView3<f32>) -> Result<ArrayD<f32>> {
        let patches = patches.to_owned();
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&patches)?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .to_owned())
    }
}

/// Classifier backed by an ONNX Runtime session.
///
/// Inputs after the first are trainable parameters exported as optional graph
/// inputs. Values merged from a checkpoint are fed through them on every run;
/// parameters that are not fed keep the initializers stored in the graph.
pub struct OnnxClassificationModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    num_classes: Option<usize>,
    parameters: Vec<(String, ArrayD<f32>)>,
}

impl OnnxClassificationModel {
    pub fn new(
        model_path: &Path,
        checkpoint: Option<&Path>,
        options: SessionOptions,
    ) -> Result<Self> {
        let session = build_session(model_path, options)?;
        let (input_name, output_name) = io_names(&session)?;

        let side = INPUT_SIZE as usize;
        check_declared(
            "classifier input",
            declared_shape(&session.inputs[0].input_type),
            &[1, 3, side, side],
        )?;

        let num_classes = declared_shape(&session.outputs[0].output_type)
            .and_then(|shape| shape.last().copied())
            .filter(|&n| n > 0)
            .map(|n| n as usize);

        let parameters = match checkpoint {
            Some(path) => {
                let targets = parameter_specs(&session);
                let checkpoint = Checkpoint::load(path)?;
                debug!(
                    parameter_inputs = targets.len(),
                    checkpoint_entries = checkpoint.len(),
                    "classifier weight migration"
                );
                let migrated = migrate(&targets, checkpoint)?;
                migrated.manifest.log();
                migrated.parameters
            }
            None => Vec::new(),
        };

        let model = Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            num_classes,
            parameters,
        };

        // initialize model
        let data = Array4::<f32>::zeros((1, 3, side, side));
        let logits = model.forward(data.view())?;
        info!(
            path = %model_path.display(),
            classes = logits.ncols(),
            fed_parameters = model.parameters.len(),
            "classifier loaded"
        );

        Ok(model)
    }
}

fn parameter_specs(session: &Session) -> Vec<ParameterSpec> {
    session
        .inputs
        .iter()
        .skip(1)
        .filter_map(|input| {
            declared_shape(&input.input_type)
                .map(|shape| ParameterSpec::new(input.name.clone(), shape))
        })
        .collect()
}

impl ClassificationModel for OnnxClassificationModel {
    fn forward(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let images = images.to_owned();
        let mut inputs = ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&images)?
        ];
        for (name, value) in &self.parameters {
            inputs.push((
                Cow::from(name.as_str()),
                TensorRef::from_array_view(value)?.into(),
            ));
        }

        let mut session = self.session.lock();
        let outputs = session.run(inputs)?;
        let logits = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        let batch = logits.shape().first().copied().unwrap_or(0);
        let logits = logits
            .to_owned()
            .into_shape_with_order((batch, logits.len() / batch.max(1)))?;
        Ok(logits)
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_declared_accepts_dynamic_dims() {
        assert!(check_declared("x", Some(vec![-1, 256, 768]), &[1, 256, 768]).is_ok());
        assert!(check_declared("x", None, &[1, 256, 768]).is_ok());
    }

    #[test]
    fn test_check_declared_rejects_static_mismatch() {
        let err = check_declared("x", Some(vec![1, 196, 768]), &[1, 256, 768]).unwrap_err();
        assert!(matches!(err, ScanError::ShapeMismatch { .. }));

        let err = check_declared("x", Some(vec![1, 256]), &[1, 256, 768]).unwrap_err();
        assert!(matches!(err, ScanError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_missing_model_file() {
        let result = OnnxSegmentationModel::new(
            Path::new("/nonexistent/best_model.onnx"),
            PatchGrid::new(256, 16, 3).unwrap(),
            SessionOptions::default(),
        );
        assert!(matches!(result, Err(ScanError::Model { .. })));
    }
}
