//! Checkpoints as single safetensors files.
//!
//! Model parameters live under `model.`, the EMA shadow under `ema.`, and the
//! optimizer and scaler state as opaque byte tensors. Counters and the best
//! metric go in the header metadata next to a `kind` tag that tells a full
//! checkpoint from a weights-only seed.

use crate::{
    error::CheckpointError,
    scaler::GradScalerState,
    tensor::{StateDict, Tensor},
};
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

const MODEL_PREFIX: &str = "model.";
const EMA_PREFIX: &str = "ema.";
const OPTIMIZER_TENSOR: &str = "optimizer_state";
const SCALER_TENSOR: &str = "scaler_state";

const KIND_KEY: &str = "kind";
const EPOCH_KEY: &str = "epoch";
const ITERATIONS_KEY: &str = "iterations";
const BEST_METRIC_KEY: &str = "best_metric";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Checkpoint,
    Weights,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointKind::Checkpoint => "checkpoint",
            CheckpointKind::Weights => "weights",
        }
    }
}

impl FromStr for CheckpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoint" => Ok(CheckpointKind::Checkpoint),
            "weights" => Ok(CheckpointKind::Weights),
            other => Err(format!("unknown checkpoint kind {other:?}")),
        }
    }
}

/// Everything needed to continue a run where it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub weights: StateDict,
    pub optimizer_state: Vec<u8>,
    pub scaler: GradScalerState,
    pub ema_weights: Option<StateDict>,
    /// Last completed epoch.
    pub epoch: u64,
    /// Last completed iteration.
    pub iterations: u64,
    pub best_metric: f64,
}

/// Weights to start a new run from.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedWeights {
    pub weights: StateDict,
    pub ema_weights: Option<StateDict>,
}

pub trait CheckpointStore: Send + Sync {
    /// Read a full checkpoint. Any missing piece fails the whole load.
    fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError>;

    /// Read only model (and EMA, if present) weights. Accepts full checkpoints too.
    fn load_weights_only(&self, path: &Path) -> Result<SeedWeights, CheckpointError>;

    fn save(&self, path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn save_weights(&self, path: &Path, seed: &SeedWeights) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsStore;

impl CheckpointStore for SafetensorsStore {
    fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let file = CheckpointFile::read(path)?;
        if file.kind != CheckpointKind::Checkpoint {
            return Err(CheckpointError::WeightsOnly(path.to_path_buf()));
        }
        let epoch = file.field(EPOCH_KEY)?;
        let iterations = file.field(ITERATIONS_KEY)?;
        let best_metric = file.field(BEST_METRIC_KEY)?;
        let optimizer_state = file
            .optimizer_state
            .ok_or_else(|| missing(path, OPTIMIZER_TENSOR))?;
        let scaler_bytes = file
            .scaler_state
            .ok_or_else(|| missing(path, SCALER_TENSOR))?;
        let scaler =
            GradScalerState::from_bytes(&scaler_bytes).map_err(|e| CheckpointError::Malformed {
                path: path.to_path_buf(),
                field: SCALER_TENSOR.to_string(),
                reason: e.to_string(),
            })?;
        if file.weights.is_empty() {
            return Err(missing(path, "model weights"));
        }
        debug!(path = %path.display(), epoch, iterations, "Read checkpoint");
        Ok(Checkpoint {
            weights: file.weights,
            optimizer_state,
            scaler,
            ema_weights: (!file.ema.is_empty()).then_some(file.ema),
            epoch,
            iterations,
            best_metric,
        })
    }

    fn load_weights_only(&self, path: &Path) -> Result<SeedWeights, CheckpointError> {
        let file = CheckpointFile::read(path)?;
        if file.weights.is_empty() {
            return Err(missing(path, "model weights"));
        }
        Ok(SeedWeights {
            weights: file.weights,
            ema_weights: (!file.ema.is_empty()).then_some(file.ema),
        })
    }

    fn save(&self, path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut entries = param_entries(MODEL_PREFIX, &checkpoint.weights);
        if let Some(ema) = &checkpoint.ema_weights {
            entries.extend(param_entries(EMA_PREFIX, ema));
        }
        let scaler_bytes = checkpoint
            .scaler
            .to_bytes()
            .map_err(|e| CheckpointError::Malformed {
                path: path.to_path_buf(),
                field: SCALER_TENSOR.to_string(),
                reason: e.to_string(),
            })?;
        entries.push(byte_entry(OPTIMIZER_TENSOR, checkpoint.optimizer_state.clone()));
        entries.push(byte_entry(SCALER_TENSOR, scaler_bytes));

        let metadata = HashMap::from([
            (
                KIND_KEY.to_string(),
                CheckpointKind::Checkpoint.as_str().to_string(),
            ),
            (EPOCH_KEY.to_string(), checkpoint.epoch.to_string()),
            (ITERATIONS_KEY.to_string(), checkpoint.iterations.to_string()),
            (BEST_METRIC_KEY.to_string(), checkpoint.best_metric.to_string()),
        ]);
        write_file(path, entries, metadata)
    }

    fn save_weights(&self, path: &Path, seed: &SeedWeights) -> Result<(), CheckpointError> {
        let mut entries = param_entries(MODEL_PREFIX, &seed.weights);
        if let Some(ema) = &seed.ema_weights {
            entries.extend(param_entries(EMA_PREFIX, ema));
        }
        let metadata = HashMap::from([(
            KIND_KEY.to_string(),
            CheckpointKind::Weights.as_str().to_string(),
        )]);
        write_file(path, entries, metadata)
    }
}

struct CheckpointFile {
    path: PathBuf,
    kind: CheckpointKind,
    metadata: HashMap<String, String>,
    weights: StateDict,
    ema: StateDict,
    optimizer_state: Option<Vec<u8>>,
    scaler_state: Option<Vec<u8>>,
}

impl CheckpointFile {
    fn read(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = std::fs::read(path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => CheckpointError::NotFound(path.to_path_buf()),
            _ => CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let format_err = |source| CheckpointError::Format {
            path: path.to_path_buf(),
            source,
        };
        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(format_err)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(&bytes).map_err(format_err)?;

        let mut weights = StateDict::new();
        let mut ema = StateDict::new();
        let mut optimizer_state = None;
        let mut scaler_state = None;
        for (name, view) in tensors.tensors() {
            if name == OPTIMIZER_TENSOR {
                optimizer_state = Some(read_bytes(path, &name, &view)?);
            } else if name == SCALER_TENSOR {
                scaler_state = Some(read_bytes(path, &name, &view)?);
            } else if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
                weights.insert(param.to_string(), read_f32(path, &name, &view)?);
            } else if let Some(param) = name.strip_prefix(EMA_PREFIX) {
                ema.insert(param.to_string(), read_f32(path, &name, &view)?);
            } else {
                return Err(CheckpointError::UnexpectedTensor {
                    path: path.to_path_buf(),
                    name,
                });
            }
        }

        let mut file = Self {
            path: path.to_path_buf(),
            kind: CheckpointKind::Checkpoint,
            metadata,
            weights,
            ema,
            optimizer_state,
            scaler_state,
        };
        file.kind = file.field(KIND_KEY)?;
        Ok(file)
    }

    fn field<T>(&self, key: &str) -> Result<T, CheckpointError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .metadata
            .get(key)
            .ok_or_else(|| missing(&self.path, key))?;
        raw.parse().map_err(|e: T::Err| CheckpointError::Malformed {
            path: self.path.clone(),
            field: key.to_string(),
            reason: e.to_string(),
        })
    }
}

fn missing(path: &Path, field: &str) -> CheckpointError {
    CheckpointError::MissingField {
        path: path.to_path_buf(),
        field: field.to_string(),
    }
}

fn read_f32(path: &Path, name: &str, view: &TensorView<'_>) -> Result<Tensor, CheckpointError> {
    if view.dtype() != Dtype::F32 {
        return Err(CheckpointError::UnsupportedDtype {
            path: path.to_path_buf(),
            name: name.to_string(),
            dtype: format!("{:?}", view.dtype()),
        });
    }
    Ok(Tensor::from_le_bytes(view.shape().to_vec(), view.data())?)
}

fn read_bytes(path: &Path, name: &str, view: &TensorView<'_>) -> Result<Vec<u8>, CheckpointError> {
    if view.dtype() != Dtype::U8 {
        return Err(CheckpointError::Malformed {
            path: path.to_path_buf(),
            field: name.to_string(),
            reason: format!("expected U8 bytes, found {:?}", view.dtype()),
        });
    }
    Ok(view.data().to_vec())
}

struct Entry {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

fn param_entries(prefix: &str, params: &StateDict) -> Vec<Entry> {
    params
        .iter()
        .map(|(name, tensor)| Entry {
            name: format!("{prefix}{name}"),
            dtype: Dtype::F32,
            shape: tensor.shape().to_vec(),
            bytes: tensor.to_le_bytes(),
        })
        .collect()
}

fn byte_entry(name: &str, bytes: Vec<u8>) -> Entry {
    Entry {
        name: name.to_string(),
        dtype: Dtype::U8,
        shape: vec![bytes.len()],
        bytes,
    }
}

/// Serializes into a sibling temp file first so a crash never leaves a torn checkpoint.
fn write_file(
    path: &Path,
    entries: Vec<Entry>,
    metadata: HashMap<String, String>,
) -> Result<(), CheckpointError> {
    let views = entries
        .iter()
        .map(|entry| {
            TensorView::new(entry.dtype, entry.shape.clone(), &entry.bytes)
                .map(|view| (entry.name.as_str(), view))
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(CheckpointError::Serialize)?;
    let bytes = safetensors::serialize(views, Some(metadata)).map_err(CheckpointError::Serialize)?;

    let io_err = |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("safetensors.tmp");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    debug!(path = %path.display(), "Wrote checkpoint");
    Ok(())
}
