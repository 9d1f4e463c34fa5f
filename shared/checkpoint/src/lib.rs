mod ema;
mod error;
mod resume;
mod scaler;
mod store;
mod tensor;

pub use ema::ExponentialMovingAverage;
pub use error::CheckpointError;
pub use resume::{CheckpointResumer, RestoredState, ResumedState};
pub use scaler::GradScalerState;
pub use store::{Checkpoint, CheckpointKind, CheckpointStore, SafetensorsStore, SeedWeights};
pub use tensor::{ShapeError, StateDict, Tensor};
