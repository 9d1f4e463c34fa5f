use crate::{
    error::CheckpointError,
    scaler::GradScalerState,
    store::{Checkpoint, CheckpointStore},
    tensor::StateDict,
};
use kiln_core::{MetricPolarity, RecoverySource, Role};
use std::path::Path;
use tracing::info;

/// What was restored, if anything. Each variant is the complete result of one read.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoredState {
    Fresh,
    FineTune {
        weights: StateDict,
        ema_weights: Option<StateDict>,
    },
    Resume {
        weights: StateDict,
        optimizer_state: Vec<u8>,
        scaler: GradScalerState,
        ema_weights: Option<StateDict>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumedState {
    pub restored: RestoredState,
    pub start_epoch: u64,
    pub start_iteration: u64,
    pub best_metric: f64,
}

impl ResumedState {
    pub fn fresh(polarity: MetricPolarity) -> Self {
        Self {
            restored: RestoredState::Fresh,
            start_epoch: 0,
            start_iteration: 0,
            best_metric: polarity.initial_best(),
        }
    }

    fn from_checkpoint(checkpoint: Checkpoint, ema_enabled: bool) -> Self {
        Self {
            start_epoch: checkpoint.epoch + 1,
            start_iteration: checkpoint.iterations + 1,
            best_metric: checkpoint.best_metric,
            restored: RestoredState::Resume {
                weights: checkpoint.weights,
                optimizer_state: checkpoint.optimizer_state,
                scaler: checkpoint.scaler,
                ema_weights: checkpoint.ema_weights.filter(|_| ema_enabled),
            },
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self.restored, RestoredState::Fresh)
    }
}

/// Picks the one recovery path for this run and performs it.
pub struct CheckpointResumer<'a> {
    store: &'a dyn CheckpointStore,
    polarity: MetricPolarity,
    ema_enabled: bool,
    role: Role,
}

impl<'a> CheckpointResumer<'a> {
    pub fn new(
        store: &'a dyn CheckpointStore,
        polarity: MetricPolarity,
        ema_enabled: bool,
        role: Role,
    ) -> Self {
        Self {
            store,
            polarity,
            ema_enabled,
            role,
        }
    }

    pub fn resume(&self, recovery: &RecoverySource) -> Result<ResumedState, CheckpointError> {
        match recovery {
            RecoverySource::Fresh => Ok(ResumedState::fresh(self.polarity)),
            RecoverySource::Resume(path) => self.resume_from(path),
            RecoverySource::AutoResume(path) if !path.exists() => {
                if self.role.is_leader() {
                    info!(
                        path = %path.display(),
                        "Auto-resume enabled but no checkpoint found, starting fresh"
                    );
                }
                Ok(ResumedState::fresh(self.polarity))
            }
            RecoverySource::AutoResume(path) => self.resume_from(path),
            RecoverySource::FineTune(path) => self.fine_tune_from(path),
        }
    }

    fn resume_from(&self, path: &Path) -> Result<ResumedState, CheckpointError> {
        let checkpoint = self.store.load(path)?;
        let state = ResumedState::from_checkpoint(checkpoint, self.ema_enabled);
        if self.role.is_leader() {
            info!(
                path = %path.display(),
                start_epoch = state.start_epoch,
                start_iteration = state.start_iteration,
                best_metric = state.best_metric,
                "Resuming training"
            );
        }
        Ok(state)
    }

    fn fine_tune_from(&self, path: &Path) -> Result<ResumedState, CheckpointError> {
        let seed = self.store.load_weights_only(path)?;
        if self.role.is_leader() {
            info!(path = %path.display(), "Fine-tuning from pretrained weights");
        }
        Ok(ResumedState {
            restored: RestoredState::FineTune {
                weights: seed.weights,
                ema_weights: seed.ema_weights.filter(|_| self.ema_enabled),
            },
            ..ResumedState::fresh(self.polarity)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SafetensorsStore, SeedWeights, Tensor};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn weights(value: f32) -> StateDict {
        StateDict::from([("conv.weight".to_string(), Tensor::full(vec![4], value))])
    }

    fn write_checkpoint(dir: &Path, best_metric: f64) -> PathBuf {
        let path = dir.join("checkpoint.safetensors");
        SafetensorsStore
            .save(
                &path,
                &Checkpoint {
                    weights: weights(1.0),
                    optimizer_state: vec![9; 16],
                    scaler: GradScalerState::new(true),
                    ema_weights: Some(weights(0.9)),
                    epoch: 11,
                    iterations: 5500,
                    best_metric,
                },
            )
            .unwrap();
        path
    }

    #[test]
    fn fresh_run_uses_polarity_default() {
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Maximize, false, Role::Leader);
        let state = resumer.resume(&RecoverySource::Fresh).unwrap();
        assert_eq!(state, ResumedState::fresh(MetricPolarity::Maximize));
        assert_eq!(state.best_metric, 0.0);

        let minimize = ResumedState::fresh(MetricPolarity::Minimize);
        assert_eq!(minimize.best_metric, f64::INFINITY);
    }

    #[test_log::test]
    fn resume_takes_everything_from_one_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 0.83);
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Maximize, true, Role::Leader);
        let state = resumer.resume(&RecoverySource::Resume(path)).unwrap();

        assert_eq!(state.best_metric, 0.83);
        assert_eq!(state.start_epoch, 12);
        assert_eq!(state.start_iteration, 5501);
        assert_eq!(
            state.restored,
            RestoredState::Resume {
                weights: weights(1.0),
                optimizer_state: vec![9; 16],
                scaler: GradScalerState::new(true),
                ema_weights: Some(weights(0.9)),
            }
        );
    }

    #[test]
    fn resume_drops_ema_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 1.5);
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Minimize, false, Role::Worker);
        let state = resumer.resume(&RecoverySource::Resume(path)).unwrap();
        let RestoredState::Resume { ema_weights, .. } = state.restored else {
            panic!("expected a resumed state");
        };
        assert_eq!(ema_weights, None);
    }

    #[test]
    fn explicit_resume_of_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Minimize, false, Role::Leader);
        let err = resumer
            .resume(&RecoverySource::Resume(dir.path().join("gone.safetensors")))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[test_log::test]
    fn auto_resume_without_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Minimize, false, Role::Leader);
        let state = resumer
            .resume(&RecoverySource::AutoResume(
                dir.path().join("checkpoint.safetensors"),
            ))
            .unwrap();
        assert!(state.is_fresh());
        assert_eq!(state.best_metric, f64::INFINITY);
    }

    #[test]
    fn auto_resume_picks_up_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 0.2);
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Minimize, false, Role::Leader);
        let state = resumer.resume(&RecoverySource::AutoResume(path)).unwrap();
        assert_eq!((state.start_epoch, state.start_iteration), (12, 5501));
        assert_eq!(state.best_metric, 0.2);
    }

    #[test]
    fn fine_tune_with_ema_disabled_keeps_fresh_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_checkpoint(dir.path(), 0.83);
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Maximize, false, Role::Leader);
        let state = resumer.resume(&RecoverySource::FineTune(path)).unwrap();
        assert_eq!(
            state,
            ResumedState {
                restored: RestoredState::FineTune {
                    weights: weights(1.0),
                    ema_weights: None,
                },
                start_epoch: 0,
                start_iteration: 0,
                best_metric: 0.0,
            }
        );
    }

    #[test]
    fn fine_tune_with_ema_takes_seed_ema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.safetensors");
        SafetensorsStore
            .save_weights(
                &path,
                &SeedWeights {
                    weights: weights(2.0),
                    ema_weights: Some(weights(1.9)),
                },
            )
            .unwrap();
        let resumer =
            CheckpointResumer::new(&SafetensorsStore, MetricPolarity::Minimize, true, Role::Leader);
        let state = resumer.resume(&RecoverySource::FineTune(path)).unwrap();
        assert_eq!(
            state.restored,
            RestoredState::FineTune {
                weights: weights(2.0),
                ema_weights: Some(weights(1.9)),
            }
        );
    }
}
