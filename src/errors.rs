use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which of the two decode paths rejected an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    /// Integer raster used by the patch encoder.
    Primary,
    /// Library-native image object used by the classifier.
    Secondary,
}

impl fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// The two models served by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Segmentation,
    Classification,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segmentation => f.write_str("segmentation"),
            Self::Classification => f.write_str("classification"),
        }
    }
}

/// Structured error types for the inference server.
///
/// # Why structured errors
///
/// Each variant maps onto one row of the request error taxonomy (decode, shape,
/// unavailable model, unavailable artifact) or onto an infrastructure failure
/// with its own context. The HTTP layer matches on variants to pick a status
/// code, so nothing downstream has to parse messages.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing upload: multipart field `{field}` not present")]
    MissingUpload { field: String },

    #[error("Upload error: multipart body could not be read")]
    Upload {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Upload exceeds the {limit} byte limit")]
    UploadTooLarge { limit: usize },

    #[error("Decode error: {stage} decode of the upload failed")]
    Decode {
        stage: DecodeStage,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{model} model unavailable")]
    UnavailableModel { model: ModelKind },

    #[error("Overlay artifact not found")]
    UnavailableArtifact { id: Option<String> },

    #[error("Image processing error: {operation} failed")]
    ImageProcessing {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Checkpoint error: {operation} failed for {path:?}")]
    Checkpoint {
        path: PathBuf,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<Vec<usize>>,
        actual: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn model(operation: impl Into<String>, source: ort::Error) -> Self {
        Self::Model {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

/// Convert anyhow errors to configuration errors.
///
/// # Why this conversion exists
///
/// The binary edge works in anyhow; when one of those errors crosses back into
/// the library it is almost always a startup misconfiguration, so it lands in
/// the configuration bucket rather than dragging anyhow through the public API.
impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Callers that know the path and operation should build
/// `ScanError::FileSystem` directly; this is the fallback.
impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for ScanError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for ScanError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to model errors.
///
/// # Why model error category
///
/// Reshapes only happen while building or unpacking model tensors, and the
/// ones with a meaningful expected/actual pair are reported as
/// `ShapeMismatch` at the call site instead.
impl From<ndarray::ShapeError> for ScanError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<safetensors::SafeTensorError> for ScanError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::Checkpoint {
            path: PathBuf::from("unknown"),
            operation: "safetensors deserialization".to_string(),
            source: Box::new(err),
        }
    }
}
