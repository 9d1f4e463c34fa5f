use crate::{
    placement::Placement,
    session::TrainingSession,
    tracker::{ExperimentTracker, TrackerRun},
    traits::{ComponentFactory, DataFactory, ModelFactory, TrainingLoop},
};
use kiln_checkpoint::{
    CheckpointError, CheckpointResumer, CheckpointStore, ExponentialMovingAverage,
    GradScalerState, RestoredState,
};
use kiln_core::{ResolvedRunConfig, WorkerIdentity};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("couldn't create experiment directory {}: {source}", path.display())]
    ExperimentDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to build data loaders: {0:#}")]
    Data(anyhow::Error),

    #[error("failed to build model: {0:#}")]
    Model(anyhow::Error),

    #[error("failed to place model on {placement}: {cause:#}")]
    Placement {
        placement: Placement,
        cause: anyhow::Error,
    },

    #[error("failed to build training components: {0:#}")]
    Components(anyhow::Error),

    #[error("couldn't recover training state: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("restored state doesn't fit this run: {0:#}")]
    IncompatibleState(anyhow::Error),

    #[error("training loop failed: {0:#}")]
    TrainingLoop(anyhow::Error),

    #[error("run interrupted")]
    Interrupted,
}

/// Factories and stores a run is assembled from.
pub struct Collaborators {
    pub models: Box<dyn ModelFactory>,
    pub components: Box<dyn ComponentFactory>,
    pub data: Box<dyn DataFactory>,
    pub tracker: Option<Box<dyn ExperimentTracker>>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub training_loop: Box<dyn TrainingLoop>,
}

/// Builds one worker's training session in a fixed order and hands it to the loop.
pub struct RunSupervisor {
    identity: WorkerIdentity,
    config: ResolvedRunConfig,
    collaborators: Collaborators,
    cancellation: CancellationToken,
}

impl RunSupervisor {
    pub fn new(
        identity: WorkerIdentity,
        config: ResolvedRunConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            identity,
            config,
            collaborators,
            cancellation: CancellationToken::new(),
        }
    }

    /// Interrupts the run once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Runs the session to completion. An interrupted run is an error, even if
    /// the loop itself returned cleanly.
    pub fn run(self) -> Result<(), SupervisorError> {
        let cancellation = self.cancellation.clone();
        let (session, mut training_loop) = self.prepare()?;
        if cancellation.is_cancelled() {
            warn!("Interrupted before training started");
            return Err(SupervisorError::Interrupted);
        }
        info!(
            rank = session.identity.rank(),
            start_epoch = session.start_epoch,
            start_iteration = session.start_iteration,
            "Handing off to training loop"
        );
        let result = training_loop
            .run(session)
            .map_err(SupervisorError::TrainingLoop);
        if cancellation.is_cancelled() {
            warn!("Run interrupted, last saved checkpoint is the latest state");
            return Err(SupervisorError::Interrupted);
        }
        result
    }

    /// Everything up to the hand-off: the session plus the loop that will run it.
    pub fn prepare(self) -> Result<(TrainingSession, Box<dyn TrainingLoop>), SupervisorError> {
        let Self {
            identity,
            config,
            collaborators,
            cancellation,
        } = self;
        let role = identity.role();

        let tracker = if role.is_leader() {
            std::fs::create_dir_all(&config.exp_dir).map_err(|source| {
                SupervisorError::ExperimentDir {
                    path: config.exp_dir.clone(),
                    source,
                }
            })?;
            init_tracker(collaborators.tracker.as_deref(), &config)
        } else {
            None
        };

        let data = collaborators
            .data
            .build(&config, &identity)
            .map_err(SupervisorError::Data)?;

        let horizon = config.horizon;

        let mut model = collaborators
            .models
            .build(&config)
            .map_err(SupervisorError::Model)?;
        let placement = Placement::for_worker(&identity, &config);
        model
            .place(&placement)
            .map_err(|cause| SupervisorError::Placement {
                placement: placement.clone(),
                cause,
            })?;
        debug!(%placement, "Model placed");

        let components = collaborators
            .components
            .build(&config, model.as_ref())
            .map_err(SupervisorError::Components)?;
        let mut optimizer = components.optimizer;
        let mut scaler = GradScalerState::new(config.mixed_precision);

        let mut ema = config.ema.as_ref().map(|settings| {
            if role.is_leader() {
                info!(momentum = settings.momentum, "Using EMA");
            }
            ExponentialMovingAverage::new(model.parameters(), settings.momentum)
        });

        let resumed = CheckpointResumer::new(
            collaborators.checkpoints.as_ref(),
            config.metric.polarity,
            ema.is_some(),
            role,
        )
        .resume(&config.recovery)?;

        match resumed.restored {
            RestoredState::Fresh => {}
            RestoredState::FineTune {
                weights,
                ema_weights,
            } => {
                model
                    .load_state_dict(&weights)
                    .map_err(SupervisorError::IncompatibleState)?;
                if let Some(ema) = ema.as_mut() {
                    ema.load_state(ema_weights.unwrap_or(weights))?;
                }
            }
            RestoredState::Resume {
                weights,
                optimizer_state,
                scaler: restored_scaler,
                ema_weights,
            } => {
                model
                    .load_state_dict(&weights)
                    .map_err(SupervisorError::IncompatibleState)?;
                optimizer
                    .load_state(&optimizer_state)
                    .map_err(SupervisorError::IncompatibleState)?;
                scaler = restored_scaler;
                if let Some(ema) = ema.as_mut() {
                    ema.load_state(ema_weights.unwrap_or(weights))?;
                }
            }
        }

        let session = TrainingSession {
            identity,
            horizon,
            placement,
            model,
            criterion: components.criterion,
            optimizer,
            scaler,
            schedule: components.schedule,
            ema,
            train_loader: data.train,
            val_loader: data.val,
            train_sampler: data.train_sampler,
            start_epoch: resumed.start_epoch,
            start_iteration: resumed.start_iteration,
            best_metric: resumed.best_metric,
            tracker,
            checkpoints: collaborators.checkpoints,
            cancellation,
            config,
        };
        Ok((session, collaborators.training_loop))
    }
}

/// Tracker failures never stop a run.
fn init_tracker(
    tracker: Option<&dyn ExperimentTracker>,
    config: &ResolvedRunConfig,
) -> Option<Box<dyn TrackerRun>> {
    let (tracker, settings) = match (tracker, &config.tracker) {
        (Some(tracker), Some(settings)) => (tracker, settings),
        (None, Some(_)) => {
            info!("No experiment tracker available. Will continue training without it.");
            return None;
        }
        (_, None) => return None,
    };
    match tracker.init(&settings.project, config, &config.run_label, &settings.tags) {
        Ok(run) => {
            info!(project = %settings.project, run = %config.run_label, "Experiment tracking enabled");
            Some(run)
        }
        Err(err) => {
            error!("Could not initialize experiment tracker. Will continue training without it.");
            debug!("tracker error: {err:?}");
            None
        }
    }
}
