//! Seams to the collaborators a run is assembled from. The supervisor never looks
//! inside any of these beyond what's declared here.

use crate::{placement::Placement, session::TrainingSession};
use anyhow::{bail, Result};
use kiln_checkpoint::{StateDict, Tensor};
use kiln_core::{ResolvedRunConfig, WorkerIdentity};

/// One mini-batch: `inputs` is `[batch, features]`, `targets` is `[batch]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

pub trait TrainableModel: Send {
    fn forward(&mut self, batch: &Batch) -> Result<Tensor>;

    /// Gradients of the loss w.r.t. every parameter, given its gradient w.r.t. the output.
    fn backward(&mut self, batch: &Batch, output_grad: &Tensor) -> Result<StateDict>;

    fn parameters(&self) -> &StateDict;

    fn parameters_mut(&mut self) -> &mut StateDict;

    /// Move, replicate or wrap the model as `placement` says.
    fn place(&mut self, placement: &Placement) -> Result<()>;

    fn load_state_dict(&mut self, weights: &StateDict) -> Result<()> {
        let params = self.parameters_mut();
        for (name, param) in params.iter() {
            match weights.get(name) {
                None => bail!("missing parameter {name}"),
                Some(w) if w.shape() != param.shape() => bail!(
                    "parameter {name} has shape {:?}, checkpoint has {:?}",
                    param.shape(),
                    w.shape()
                ),
                Some(_) => {}
            }
        }
        if let Some(extra) = weights.keys().find(|k| !params.contains_key(*k)) {
            bail!("unexpected parameter {extra}");
        }
        params.clone_from(weights);
        Ok(())
    }
}

pub trait Criterion: Send {
    fn name(&self) -> &str;

    /// Mean loss over the batch and its gradient w.r.t. `output`.
    fn loss(&self, output: &Tensor, targets: &Tensor) -> Result<(f64, Tensor)>;
}

pub trait Optimizer: Send {
    fn step(&mut self, params: &mut StateDict, grads: &StateDict, lr: f64) -> Result<()>;

    fn state(&self) -> Result<Vec<u8>>;

    fn load_state(&mut self, state: &[u8]) -> Result<()>;
}

pub trait LrSchedule: Send {
    fn learning_rate(&self, epoch: u64, iteration: u64) -> f64;
}

/// Decides which samples this worker sees, and in what order, each epoch.
pub trait Sampler: Send {
    fn set_epoch(&mut self, epoch: u64);

    fn indices(&self, dataset_len: usize) -> Vec<usize>;
}

pub trait DataLoader: Send {
    fn dataset_len(&self) -> usize;

    fn batch_size(&self) -> usize;

    fn load(&self, indices: &[usize]) -> Result<Batch>;
}

pub struct TrainingComponents {
    pub criterion: Box<dyn Criterion>,
    pub optimizer: Box<dyn Optimizer>,
    pub schedule: Box<dyn LrSchedule>,
}

pub struct DataLoaders {
    pub train: Box<dyn DataLoader>,
    pub val: Box<dyn DataLoader>,
    pub train_sampler: Box<dyn Sampler>,
}

pub trait ModelFactory: Send + Sync {
    fn build(&self, config: &ResolvedRunConfig) -> Result<Box<dyn TrainableModel>>;
}

pub trait ComponentFactory: Send + Sync {
    fn build(
        &self,
        config: &ResolvedRunConfig,
        model: &dyn TrainableModel,
    ) -> Result<TrainingComponents>;
}

pub trait DataFactory: Send + Sync {
    fn build(&self, config: &ResolvedRunConfig, identity: &WorkerIdentity) -> Result<DataLoaders>;
}

/// Drives the actual training. Expected to step the EMA after every optimizer
/// step and to persist checkpoints on its own schedule.
pub trait TrainingLoop: Send {
    fn run(&mut self, session: TrainingSession) -> Result<()>;
}
