use crate::{
    placement::Placement,
    tracker::TrackerRun,
    traits::{Criterion, DataLoader, LrSchedule, Optimizer, Sampler, TrainableModel},
};
use anyhow::Result;
use kiln_checkpoint::{Checkpoint, CheckpointStore, ExponentialMovingAverage, GradScalerState};
use kiln_core::{ResolvedRunConfig, Role, TrainingHorizon, WorkerIdentity};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a training loop needs, in a consistent starting state.
pub struct TrainingSession {
    pub identity: WorkerIdentity,
    pub config: ResolvedRunConfig,
    pub horizon: TrainingHorizon,
    pub placement: Placement,
    pub model: Box<dyn TrainableModel>,
    pub criterion: Box<dyn Criterion>,
    pub optimizer: Box<dyn Optimizer>,
    pub scaler: GradScalerState,
    pub schedule: Box<dyn LrSchedule>,
    pub ema: Option<ExponentialMovingAverage>,
    pub train_loader: Box<dyn DataLoader>,
    pub val_loader: Box<dyn DataLoader>,
    pub train_sampler: Box<dyn Sampler>,
    pub start_epoch: u64,
    pub start_iteration: u64,
    pub best_metric: f64,
    pub tracker: Option<Box<dyn TrackerRun>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Cancelled when the run is interrupted. Loops check it between steps.
    pub cancellation: CancellationToken,
}

impl TrainingSession {
    pub fn role(&self) -> Role {
        self.identity.role()
    }

    /// Snapshot of the current training state, tagged with the last completed
    /// epoch and iteration.
    pub fn checkpoint(&self, epoch: u64, iterations: u64) -> Result<Checkpoint> {
        Ok(Checkpoint {
            weights: self.model.parameters().clone(),
            optimizer_state: self.optimizer.state()?,
            scaler: self.scaler.clone(),
            ema_weights: self.ema.as_ref().map(|ema| ema.state().clone()),
            epoch,
            iterations,
            best_metric: self.best_metric,
        })
    }
}
