use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use num_traits::Float;
use walkdir::WalkDir;

use crate::errors::{ModelKind, Result, ScanError};
use crate::traits::ClassificationModel;

pub const INPUT_SIZE: u32 = 224;
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Extensions accepted as training images when recovering class names.
const IMAGE_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

/// Ordered class names; position `i` is the label of classifier output `i`.
///
/// The default index is empty and only backs a disabled classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassIndex {
    names: Vec<String>,
}

impl ClassIndex {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(ScanError::Validation {
                field: "class names".to_string(),
                reason: "at least one class is required".to_string(),
            });
        }
        Ok(Self { names })
    }

    /// Recovers class names from a labeled image directory: one subdirectory
    /// per class, sorted by name. A class directory without any image file
    /// is an error, since the classifier could never have been trained on it.
    pub fn from_directory(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ScanError::FileSystem {
                path: root.to_path_buf(),
                operation: "class directory lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "class directory does not exist",
                ),
            });
        }

        let mut names = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(true) {
            let entry = entry.map_err(|e| ScanError::FileSystem {
                path: root.to_path_buf(),
                operation: "class directory scan".to_string(),
                source: e.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !contains_image(entry.path()) {
                return Err(ScanError::Validation {
                    field: format!("class `{}`", name),
                    reason: format!("has no image files under {}", entry.path().display()),
                });
            }
            names.push(name);
        }
        names.sort();

        if names.is_empty() {
            return Err(ScanError::Validation {
                field: "class directory".to_string(),
                reason: format!("{} has no class subdirectories", root.display()),
            });
        }
        Self::new(names)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

fn contains_image(dir: &Path) -> bool {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
}

/// Result of one classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
    /// `(class name, probability)` in class index order.
    pub probabilities: Vec<(String, f32)>,
}

/// Numerically stable softmax. NaN logits get zero probability; if any
/// logit is `+inf` the `+inf` entries share all of the mass.
pub fn softmax<T: Float>(logits: &[T]) -> Vec<T> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(T::neg_infinity(), T::max);
    if max == T::neg_infinity() {
        return vec![T::zero(); logits.len()];
    }

    let exps = logits
        .iter()
        .map(|&v| {
            if v.is_nan() {
                T::zero()
            } else if max == T::infinity() {
                if v == max {
                    T::one()
                } else {
                    T::zero()
                }
            } else {
                (v - max).exp()
            }
        })
        .collect::<Vec<_>>();
    let sum = exps.iter().fold(T::zero(), |acc, &v| acc + v);
    exps.into_iter().map(|v| v / sum).collect()
}

/// Resizes to 224x224, scales to [0, 1] and applies ImageNet normalization.
/// Returns a `(1, 3, 224, 224)` tensor.
pub fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let chw = resized.as_ndarray3();

    let mut tensor = chw.mapv(|v| f32::from(v) / 255.0);
    for (c, mut channel) in tensor.axis_iter_mut(Axis(0)).enumerate() {
        channel.mapv_inplace(|v| (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
    }
    tensor.insert_axis(Axis(0))
}

/// Runs the classifier and maps its softmax output onto class names.
pub struct ClassificationPredictor<M: ClassificationModel> {
    model: Option<M>,
    classes: ClassIndex,
}

impl<M: ClassificationModel> ClassificationPredictor<M> {
    pub const fn new(model: M, classes: ClassIndex) -> Self {
        Self {
            model: Some(model),
            classes,
        }
    }

    /// Predictor for a model (or class index) that failed to load.
    pub const fn disabled(classes: ClassIndex) -> Self {
        Self {
            model: None,
            classes,
        }
    }

    pub const fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub const fn classes(&self) -> &ClassIndex {
        &self.classes
    }

    pub fn classify(&self, image: &DynamicImage) -> Result<Classification> {
        let model = self.model.as_ref().ok_or(ScanError::UnavailableModel {
            model: ModelKind::Classification,
        })?;

        let tensor = preprocess(image);
        let logits = model.forward(tensor.view())?;
        if logits.nrows() == 0 || logits.ncols() != self.classes.len() {
            return Err(ScanError::shape_mismatch(
                "classifier logits",
                vec![1, self.classes.len()],
                logits.shape().to_vec(),
            ));
        }

        let row = logits.row(0).to_vec();
        let probabilities = softmax(&row);
        let (index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });

        let label = self
            .classes
            .name(index)
            .ok_or_else(|| {
                ScanError::shape_mismatch(
                    "classifier argmax",
                    vec![self.classes.len()],
                    vec![index],
                )
            })?
            .to_string();

        Ok(Classification {
            index,
            label,
            confidence,
            probabilities: self
                .classes
                .names()
                .iter()
                .cloned()
                .zip(probabilities)
                .collect(),
        })
    }
}
