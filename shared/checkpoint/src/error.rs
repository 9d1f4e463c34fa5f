use crate::tensor::ShapeError;
use safetensors::SafeTensorError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("Couldn't access checkpoint {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not a valid safetensors file: {source}", path.display())]
    Format {
        path: PathBuf,
        source: SafeTensorError,
    },

    #[error("Serializing checkpoint failed: {0}")]
    Serialize(SafeTensorError),

    #[error("{} is missing {field}", path.display())]
    MissingField { path: PathBuf, field: String },

    #[error("{} has a malformed {field}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        field: String,
        reason: String,
    },

    #[error("{} holds only weights, can't resume training state from it", .0.display())]
    WeightsOnly(PathBuf),

    #[error("Tensor {name} in {} has dtype {dtype}, only F32 parameters are supported", path.display())]
    UnsupportedDtype {
        path: PathBuf,
        name: String,
        dtype: String,
    },

    #[error("Tensor {name} in {} doesn't belong to any known section", path.display())]
    UnexpectedTensor { path: PathBuf, name: String },

    #[error("Bad tensor shape: {0}")]
    Shape(#[from] ShapeError),

    #[error("EMA shadow and model disagree on parameter {0}")]
    EmaMismatch(String),
}
