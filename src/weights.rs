//! Best-effort migration of a classifier checkpoint into the loaded graph.
//!
//! Only entries whose name and shape match a parameter of the target graph
//! are applied; everything else is skipped and reported. Parameters the
//! checkpoint does not mention keep the values baked into the graph.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ndarray::prelude::*;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, warn};

use crate::errors::{Result, ScanError};

/// A parameter the target graph accepts, with its declared shape.
/// Negative dimensions are dynamic and match any size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }

    fn accepts(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(&expected, &actual)| expected < 0 || expected as usize == actual)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EntryData {
    F32(Vec<f32>),
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
struct CheckpointEntry {
    name: String,
    shape: Vec<usize>,
    data: EntryData,
}

/// Named tensors read from a safetensors file, sorted by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    entries: Vec<CheckpointEntry>,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| ScanError::FileSystem {
            path: path.to_path_buf(),
            operation: "checkpoint read".to_string(),
            source: e,
        })?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            ScanError::Checkpoint {
                operation, source, ..
            } => ScanError::Checkpoint {
                path: path.to_path_buf(),
                operation,
                source,
            },
            other => other,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let mut entries = tensors
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let data = match view.dtype() {
                    Dtype::F32 => EntryData::F32(
                        view.data()
                            .chunks_exact(4)
                            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                            .collect(),
                    ),
                    Dtype::F64 => EntryData::F32(
                        view.data()
                            .chunks_exact(8)
                            .map(|b| {
                                f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                                    as f32
                            })
                            .collect(),
                    ),
                    other => EntryData::Unsupported(format!("{:?}", other)),
                };
                CheckpointEntry {
                    name,
                    shape: view.shape().to_vec(),
                    data,
                }
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownName,
    ShapeMismatch { expected: Vec<i64>, actual: Vec<usize> },
    UnsupportedDtype(String),
}

/// What the migration did with every checkpoint entry and graph parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationManifest {
    pub applied: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    /// Graph parameters the checkpoint did not provide.
    pub retained: Vec<String>,
}

impl MigrationManifest {
    pub fn log(&self) {
        info!(
            applied = self.applied.len(),
            skipped = self.skipped.len(),
            retained = self.retained.len(),
            "classifier weight migration"
        );
        for name in &self.applied {
            debug!(parameter = %name, "applied checkpoint parameter");
        }
        for (name, reason) in &self.skipped {
            warn!(parameter = %name, ?reason, "skipped checkpoint parameter");
        }
        for name in &self.retained {
            debug!(parameter = %name, "kept initialized parameter");
        }
    }
}

/// Parameters to feed alongside the model input, plus the manifest.
#[derive(Debug, Clone, Default)]
pub struct MigratedWeights {
    pub parameters: Vec<(String, ArrayD<f32>)>,
    pub manifest: MigrationManifest,
}

pub fn migrate(targets: &[ParameterSpec], checkpoint: Checkpoint) -> Result<MigratedWeights> {
    let by_name = targets
        .iter()
        .map(|spec| (spec.name.as_str(), spec))
        .collect::<HashMap<_, _>>();

    let mut migrated = MigratedWeights::default();
    for entry in checkpoint.entries {
        let Some(spec) = by_name.get(entry.name.as_str()) else {
            migrated
                .manifest
                .skipped
                .push((entry.name, SkipReason::UnknownName));
            continue;
        };
        if !spec.accepts(&entry.shape) {
            let reason = SkipReason::ShapeMismatch {
                expected: spec.shape.clone(),
                actual: entry.shape,
            };
            migrated.manifest.skipped.push((entry.name, reason));
            continue;
        }
        match entry.data {
            EntryData::F32(values) => {
                let array = ArrayD::from_shape_vec(IxDyn(&entry.shape), values)?;
                migrated.manifest.applied.push(entry.name.clone());
                migrated.parameters.push((entry.name, array));
            }
            EntryData::Unsupported(dtype) => {
                migrated
                    .manifest
                    .skipped
                    .push((entry.name, SkipReason::UnsupportedDtype(dtype)));
            }
        }
    }

    migrated.manifest.retained = targets
        .iter()
        .filter(|spec| !migrated.manifest.applied.contains(&spec.name))
        .map(|spec| spec.name.clone())
        .collect();

    Ok(migrated)
}
