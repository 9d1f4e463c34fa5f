//! Small deterministic stand-ins for every collaborator: a linear model on
//! synthetic data, MSE loss, momentum SGD, a cosine schedule and a loop that
//! walks the resolved horizon. Enough to run the whole pipeline end to end
//! without a model zoo.

use crate::{
    placement::Placement,
    session::TrainingSession,
    traits::{
        Batch, ComponentFactory, Criterion, DataFactory, DataLoader, DataLoaders, LrSchedule,
        ModelFactory, Optimizer, Sampler, TrainableModel, TrainingComponents, TrainingLoop,
    },
};
use anyhow::{bail, ensure, Context, Result};
use kiln_checkpoint::{StateDict, Tensor};
use kiln_core::{ResolvedRunConfig, TrainingHorizon, WorkerIdentity};
use rand::seq::SliceRandom;
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const WEIGHT: &str = "linear.weight";
const BIAS: &str = "linear.bias";

/// Coefficients the synthetic targets are generated from.
const TRUE_WEIGHTS: [f32; 4] = [0.5, -1.0, 0.25, 2.0];
const TRUE_BIAS: f32 = 0.3;

pub fn get_dummy_parameters(features: usize) -> StateDict {
    [(WEIGHT, vec![1, features]), (BIAS, vec![1])]
        .into_iter()
        .map(|(name, shape)| (name.to_string(), Tensor::zeros(shape)))
        .collect()
}

#[derive(Debug)]
pub struct DummyModel {
    params: StateDict,
    features: usize,
}

impl DummyModel {
    pub fn new(features: usize) -> Self {
        Self {
            params: get_dummy_parameters(features),
            features,
        }
    }

    fn param(&self, name: &str) -> Result<&Tensor> {
        self.params
            .get(name)
            .with_context(|| format!("dummy model lost parameter {name}"))
    }

    fn check_inputs(&self, batch: &Batch) -> Result<usize> {
        match batch.inputs.shape() {
            [rows, cols] if *cols == self.features => Ok(*rows),
            shape => bail!(
                "expected inputs of shape [batch, {}], got {shape:?}",
                self.features
            ),
        }
    }
}

impl TrainableModel for DummyModel {
    fn forward(&mut self, batch: &Batch) -> Result<Tensor> {
        let rows = self.check_inputs(batch)?;
        let weight = self.param(WEIGHT)?.data();
        let bias = self.param(BIAS)?.data()[0];
        let output = batch
            .inputs
            .data()
            .chunks(self.features)
            .map(|x| x.iter().zip(weight).map(|(x, w)| x * w).sum::<f32>() + bias)
            .collect();
        Ok(Tensor::new(vec![rows], output)?)
    }

    fn backward(&mut self, batch: &Batch, output_grad: &Tensor) -> Result<StateDict> {
        let rows = self.check_inputs(batch)?;
        ensure!(
            output_grad.numel() == rows,
            "output gradient has {} values for {rows} rows",
            output_grad.numel()
        );
        let mut weight_grad = vec![0.0; self.features];
        for (x, g) in batch
            .inputs
            .data()
            .chunks(self.features)
            .zip(output_grad.data())
        {
            for (wg, x) in weight_grad.iter_mut().zip(x) {
                *wg += g * x;
            }
        }
        let bias_grad = output_grad.data().iter().sum::<f32>();
        Ok(StateDict::from([
            (WEIGHT.to_string(), Tensor::new(vec![1, self.features], weight_grad)?),
            (BIAS.to_string(), Tensor::new(vec![1], vec![bias_grad])?),
        ]))
    }

    fn parameters(&self) -> &StateDict {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut StateDict {
        &mut self.params
    }

    fn place(&mut self, placement: &Placement) -> Result<()> {
        // everything stays in host memory
        debug!(%placement, "Placing dummy model");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MseLoss;

impl Criterion for MseLoss {
    fn name(&self) -> &str {
        "mse"
    }

    fn loss(&self, output: &Tensor, targets: &Tensor) -> Result<(f64, Tensor)> {
        ensure!(
            output.shape() == targets.shape(),
            "output shape {:?} doesn't match targets {:?}",
            output.shape(),
            targets.shape()
        );
        let n = output.numel().max(1) as f32;
        let diff: Vec<f32> = output
            .data()
            .iter()
            .zip(targets.data())
            .map(|(o, t)| o - t)
            .collect();
        let loss = diff.iter().map(|d| (d * d) as f64).sum::<f64>() / n as f64;
        let grad = diff.iter().map(|d| 2.0 * d / n).collect();
        Ok((loss, Tensor::new(output.shape().to_vec(), grad)?))
    }
}

/// SGD with heavy-ball momentum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    momentum: f32,
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(momentum: f32) -> Self {
        Self {
            momentum,
            velocity: BTreeMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut StateDict, grads: &StateDict, lr: f64) -> Result<()> {
        let lr = lr as f32;
        for (name, param) in params.iter_mut() {
            let grad = grads
                .get(name)
                .with_context(|| format!("no gradient for {name}"))?;
            ensure!(
                grad.shape() == param.shape(),
                "gradient for {name} has the wrong shape"
            );
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.numel()]);
            for ((p, v), g) in param
                .data_mut()
                .iter_mut()
                .zip(velocity.iter_mut())
                .zip(grad.data())
            {
                *v = self.momentum * *v + g;
                *p -= lr * *v;
            }
        }
        Ok(())
    }

    fn state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn load_state(&mut self, state: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(state).context("malformed SGD state")?;
        Ok(())
    }
}

/// Cosine decay from `base_lr` to `min_lr` over whichever dimension the horizon counts.
#[derive(Debug, Clone)]
pub struct CosineSchedule {
    base_lr: f64,
    min_lr: f64,
    horizon: TrainingHorizon,
}

impl CosineSchedule {
    pub fn new(base_lr: f64, min_lr: f64, horizon: TrainingHorizon) -> Self {
        Self {
            base_lr,
            min_lr,
            horizon,
        }
    }
}

impl LrSchedule for CosineSchedule {
    fn learning_rate(&self, epoch: u64, iteration: u64) -> f64 {
        let progress = match self.horizon {
            TrainingHorizon::IterationBased { max_iterations } => {
                iteration as f64 / max_iterations as f64
            }
            TrainingHorizon::EpochBased { max_epochs } => epoch as f64 / max_epochs as f64,
        }
        .min(1.0);
        self.min_lr
            + 0.5 * (self.base_lr - self.min_lr) * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Deterministic regression data; sample `i` is always the same.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    samples: usize,
    features: usize,
    batch_size: usize,
    /// Keeps train and validation splits apart.
    offset: usize,
}

impl SyntheticData {
    pub fn new(samples: usize, features: usize, batch_size: usize, offset: usize) -> Self {
        Self {
            samples,
            features,
            batch_size,
            offset,
        }
    }

    fn sample(&self, index: usize) -> (Vec<f32>, f32) {
        let x: Vec<f32> = (0..self.features)
            .map(|j| (((index + self.offset) * (31 + 2 * j) + j * 17) % 97) as f32 / 97.0 - 0.5)
            .collect();
        let y = x
            .iter()
            .enumerate()
            .map(|(j, x)| TRUE_WEIGHTS[j % TRUE_WEIGHTS.len()] * x)
            .sum::<f32>()
            + TRUE_BIAS;
        (x, y)
    }
}

impl DataLoader for SyntheticData {
    fn dataset_len(&self) -> usize {
        self.samples
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn load(&self, indices: &[usize]) -> Result<Batch> {
        let mut inputs = Vec::with_capacity(indices.len() * self.features);
        let mut targets = Vec::with_capacity(indices.len());
        for &index in indices {
            ensure!(
                index < self.samples,
                "sample {index} out of range for {} samples",
                self.samples
            );
            let (x, y) = self.sample(index);
            inputs.extend(x);
            targets.push(y);
        }
        Ok(Batch {
            inputs: Tensor::new(vec![indices.len(), self.features], inputs)?,
            targets: Tensor::new(vec![indices.len()], targets)?,
        })
    }
}

/// Shuffles once per epoch with a seed shared by every rank, then deals every
/// `world_size`-th sample to this rank.
#[derive(Debug, Clone)]
pub struct ShardedSampler {
    rank: usize,
    world_size: usize,
    seed: u64,
    epoch: u64,
    shuffle: bool,
}

impl ShardedSampler {
    pub fn new(rank: usize, world_size: usize, seed: u64, shuffle: bool) -> Self {
        Self {
            rank,
            world_size: world_size.max(1),
            seed,
            epoch: 0,
            shuffle,
        }
    }
}

impl Sampler for ShardedSampler {
    fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    fn indices(&self, dataset_len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..dataset_len).collect();
        if self.shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(
                self.seed.wrapping_add(self.epoch),
            ));
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// Builds every dummy collaborator.
#[derive(Debug, Clone)]
pub struct DummyCollaborators {
    pub features: usize,
    pub train_samples: usize,
    pub val_samples: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for DummyCollaborators {
    fn default() -> Self {
        Self {
            features: 8,
            train_samples: 512,
            val_samples: 128,
            learning_rate: 0.05,
            seed: 0,
        }
    }
}

impl ModelFactory for DummyCollaborators {
    fn build(&self, _config: &ResolvedRunConfig) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(DummyModel::new(self.features)))
    }
}

impl ComponentFactory for DummyCollaborators {
    fn build(
        &self,
        config: &ResolvedRunConfig,
        _model: &dyn TrainableModel,
    ) -> Result<TrainingComponents> {
        Ok(TrainingComponents {
            criterion: Box::new(MseLoss),
            optimizer: Box::new(Sgd::new(0.9)),
            schedule: Box::new(CosineSchedule::new(
                self.learning_rate,
                self.learning_rate * 0.01,
                config.horizon,
            )),
        })
    }
}

impl DataFactory for DummyCollaborators {
    fn build(&self, config: &ResolvedRunConfig, identity: &WorkerIdentity) -> Result<DataLoaders> {
        Ok(DataLoaders {
            train: Box::new(SyntheticData::new(
                self.train_samples,
                self.features,
                config.data.train_batch_size,
                0,
            )),
            val: Box::new(SyntheticData::new(
                self.val_samples,
                self.features,
                config.data.val_batch_size,
                self.train_samples,
            )),
            train_sampler: Box::new(ShardedSampler::new(
                identity.rank(),
                identity.world_size(),
                self.seed,
                true,
            )),
        })
    }
}

/// Trains until the horizon is reached, evaluating and (on the leader)
/// checkpointing at the end of every epoch. Stops between steps once the
/// session is cancelled, without saving the partial epoch.
#[derive(Debug, Default)]
pub struct DummyTrainingLoop;

impl TrainingLoop for DummyTrainingLoop {
    fn run(&mut self, mut session: TrainingSession) -> Result<()> {
        let leader = session.role().is_leader();
        let polarity = session.config.metric.polarity;
        let mut epoch = session.start_epoch;
        let mut iteration = session.start_iteration;

        while !session.horizon.is_finished(epoch, iteration) {
            session.train_sampler.set_epoch(epoch);
            let order = session
                .train_sampler
                .indices(session.train_loader.dataset_len());
            let batch_size = session.train_loader.batch_size().max(1);

            let mut lr = session.schedule.learning_rate(epoch, iteration);
            let mut train_loss = 0.0;
            let mut steps = 0u64;
            for indices in order.chunks(batch_size) {
                if session.horizon.is_finished(epoch, iteration) {
                    break;
                }
                if session.cancellation.is_cancelled() {
                    info!(epoch, iteration, "Training interrupted");
                    return Ok(());
                }
                lr = session.schedule.learning_rate(epoch, iteration);
                train_loss += train_step(&mut session, indices, lr)?;
                steps += 1;
                iteration += 1;
            }
            if steps == 0 {
                warn!(epoch, "No training samples for this worker, stopping");
                break;
            }

            let val_loss = evaluate(&mut session)?;
            if polarity.is_improvement(val_loss, session.best_metric) {
                session.best_metric = val_loss;
            }
            let train_loss = train_loss / steps as f64;
            if leader {
                info!(
                    epoch,
                    iteration,
                    lr,
                    train_loss,
                    val_loss,
                    best = session.best_metric,
                    "Epoch finished"
                );
            }
            if let Some(tracker) = session.tracker.as_mut() {
                let metrics = [
                    ("train_loss", train_loss),
                    (session.config.metric.name.as_str(), val_loss),
                    ("lr", lr),
                ];
                if let Err(err) = tracker.log(epoch, iteration, &metrics) {
                    warn!("Couldn't log metrics to experiment tracker: {err:#}");
                }
            }
            if leader {
                let checkpoint = session.checkpoint(epoch, iteration.saturating_sub(1))?;
                session
                    .checkpoints
                    .save(&session.config.checkpoint_path(), &checkpoint)?;
            }
            epoch += 1;
        }
        Ok(())
    }
}

fn train_step(session: &mut TrainingSession, indices: &[usize], lr: f64) -> Result<f64> {
    let batch = session.train_loader.load(indices)?;
    let output = session.model.forward(&batch)?;
    let (loss, output_grad) = session.criterion.loss(&output, &batch.targets)?;

    let scale = session.scaler.scale as f32;
    let scaled = Tensor::new(
        output_grad.shape().to_vec(),
        output_grad.data().iter().map(|g| g * scale).collect(),
    )?;
    let mut grads = session.model.backward(&batch, &scaled)?;
    let mut found_inf = false;
    for grad in grads.values_mut() {
        for g in grad.data_mut() {
            *g /= scale;
            found_inf |= !g.is_finite();
        }
    }
    session.scaler.update(found_inf);
    if found_inf {
        debug!(scale, "Skipping step with non-finite gradients");
        return Ok(loss);
    }

    session
        .optimizer
        .step(session.model.parameters_mut(), &grads, lr)?;
    if let Some(ema) = session.ema.as_mut() {
        ema.update(session.model.parameters())?;
    }
    Ok(loss)
}

fn evaluate(session: &mut TrainingSession) -> Result<f64> {
    let len = session.val_loader.dataset_len();
    let batch_size = session.val_loader.batch_size().max(1);
    let indices: Vec<usize> = (0..len).collect();
    let mut total = 0.0;
    for chunk in indices.chunks(batch_size) {
        let batch = session.val_loader.load(chunk)?;
        let output = session.model.forward(&batch)?;
        let (loss, _) = session.criterion.loss(&output, &batch.targets)?;
        total += loss * chunk.len() as f64;
    }
    Ok(if len == 0 { f64::NAN } else { total / len as f64 })
}
