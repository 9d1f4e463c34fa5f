use crate::{
    config::RawRunConfig,
    horizon::{HorizonPolicy, TrainingHorizon},
    identity::Role,
    mode::{ExecutionMode, ModeRequest},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File looked up inside the experiment directory when auto-resuming.
pub const CHECKPOINT_FILENAME: &str = "checkpoint.safetensors";

const SYNC_BATCH_NORM_NAMES: [&str; 2] = ["sync_batch_norm", "sbn"];
const BATCH_NORM: &str = "batch_norm";

/// What the host offers. Detected once by the launcher, then treated as plain input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub num_gpus: usize,
    pub cpu_count: usize,
    pub accelerator_available: bool,
}

impl HostProfile {
    pub fn cpu_only(cpu_count: usize) -> Self {
        Self {
            num_gpus: 0,
            cpu_count,
            accelerator_available: false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ddp.rank should be >= 0, got {0}")]
    NegativeRank(i64),

    #[error("ddp.world_size should be -1 or >= 1, got {0}")]
    InvalidWorldSize(i64),

    #[error(
        "ddp.world_size {world_size} can't fit {num_gpus} workers starting at rank {start_rank}"
    )]
    WorldSizeTooSmall {
        world_size: usize,
        start_rank: usize,
        num_gpus: usize,
    },

    #[error(
        "ddp.dist_port must be set when the group spans several nodes \
         (world_size {world_size}, rank {start_rank}, {num_gpus} local gpus)"
    )]
    MissingDistPort {
        world_size: usize,
        start_rank: usize,
        num_gpus: usize,
    },

    #[error("dataset.workers should be -1 or >= 0, got {0}")]
    InvalidWorkers(i64),

    #[error("dataset batch sizes must be positive")]
    ZeroBatchSize,

    #[error("ema.momentum should be in (0, 1], got {0}")]
    InvalidEmaMomentum(f64),
}

/// Which way the checkpoint metric improves. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricPolarity {
    Minimize,
    Maximize,
}

impl MetricPolarity {
    /// Best metric before anything has been measured.
    pub fn initial_best(&self) -> f64 {
        match self {
            MetricPolarity::Minimize => f64::INFINITY,
            MetricPolarity::Maximize => 0.0,
        }
    }

    pub fn is_improvement(&self, candidate: f64, best: f64) -> bool {
        match self {
            MetricPolarity::Minimize => candidate < best,
            MetricPolarity::Maximize => candidate > best,
        }
    }
}

/// Where training state comes from, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverySource {
    /// Explicit full checkpoint.
    Resume(PathBuf),
    /// Full checkpoint at this path, if one exists yet.
    AutoResume(PathBuf),
    /// Weights-only seed.
    FineTune(PathBuf),
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSettings {
    /// Number of cooperating processes across all nodes; 1 outside process-group mode.
    pub world_size: usize,
    pub start_rank: usize,
    pub dist_url: String,
    pub dist_port: Option<u16>,
    pub backend: String,
    pub find_unused_params: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSettings {
    pub workers: usize,
    pub train_batch_size: usize,
    pub val_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaSettings {
    pub momentum: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSettings {
    pub name: String,
    pub polarity: MetricPolarity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub project: String,
    pub tags: Vec<String>,
}

/// Fully resolved configuration. No placeholders, no sentinels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRunConfig {
    pub run_label: String,
    pub exp_dir: PathBuf,
    pub mode: ExecutionMode,
    pub num_gpus: usize,
    pub distributed: DistributedSettings,
    pub data: DataSettings,
    pub normalization: String,
    pub horizon: TrainingHorizon,
    pub ema: Option<EmaSettings>,
    pub metric: MetricSettings,
    pub recovery: RecoverySource,
    pub tracker: Option<TrackerSettings>,
    pub mixed_precision: bool,
    pub channels_last: bool,
}

impl ResolvedRunConfig {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.exp_dir.join(CHECKPOINT_FILENAME)
    }
}

pub struct ConfigResolver;

impl ConfigResolver {
    pub fn resolve(
        raw: &RawRunConfig,
        host: &HostProfile,
    ) -> Result<ResolvedRunConfig, ConfigError> {
        let num_gpus = raw.dev.num_gpus.unwrap_or(host.num_gpus);
        let cpu_count = host.cpu_count.max(1);

        let start_rank = match raw.ddp.rank {
            None => 0,
            Some(rank) if rank < 0 => return Err(ConfigError::NegativeRank(rank)),
            Some(rank) => rank as usize,
        };

        let mode = ExecutionMode::select(ModeRequest {
            num_gpus,
            distributed_disabled: raw.ddp.disable,
            spawn_disabled: raw.ddp.no_spawn,
            accelerator_available: host.accelerator_available,
        });
        if num_gpus <= 1 && !raw.ddp.disable {
            debug!(num_gpus, "Distributed mode disabled, at most one GPU available");
        }

        let requested_world_size = match raw.ddp.world_size {
            None | Some(-1) => None,
            Some(world_size) if world_size < 1 => {
                return Err(ConfigError::InvalidWorldSize(world_size))
            }
            Some(world_size) => Some(world_size as usize),
        };
        let requested_workers = match raw.dataset.workers {
            None | Some(-1) => None,
            Some(workers) if workers < 0 => return Err(ConfigError::InvalidWorkers(workers)),
            Some(workers) => Some(workers as usize),
        };
        if raw.dataset.train_batch_size0 == 0 || raw.dataset.val_batch_size0 == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        let mut normalization = raw.model.normalization.name.clone();
        let (world_size, data) = if mode.uses_process_group() {
            let world_size = requested_world_size.unwrap_or_else(|| {
                info!(
                    num_gpus,
                    "Setting ddp.world_size the same as the number of available gpus"
                );
                num_gpus
            });
            if start_rank + num_gpus > world_size {
                return Err(ConfigError::WorldSizeTooSmall {
                    world_size,
                    start_rank,
                    num_gpus,
                });
            }
            // every node must dial the same rendezvous port
            if (start_rank > 0 || world_size > num_gpus) && raw.ddp.dist_port.is_none() {
                return Err(ConfigError::MissingDistPort {
                    world_size,
                    start_rank,
                    num_gpus,
                });
            }
            let data = DataSettings {
                workers: requested_workers.unwrap_or(cpu_count / num_gpus),
                train_batch_size: raw.dataset.train_batch_size0,
                val_batch_size: raw.dataset.val_batch_size0,
            };
            (world_size, data)
        } else {
            if let Some(world_size) = requested_world_size.filter(|w| *w != 1) {
                warn!(
                    world_size,
                    %mode,
                    "Ignoring ddp.world_size, this run uses a single process"
                );
            }
            if SYNC_BATCH_NORM_NAMES.contains(&normalization.as_str()) {
                warn!(
                    from = %normalization,
                    to = BATCH_NORM,
                    "Synchronized batch norm needs a process group, falling back to batch norm"
                );
                normalization = BATCH_NORM.to_string();
            }
            let scale = num_gpus.max(1);
            let data = DataSettings {
                workers: requested_workers.unwrap_or(cpu_count),
                train_batch_size: raw.dataset.train_batch_size0 * scale,
                val_batch_size: raw.dataset.val_batch_size0 * scale,
            };
            (1, data)
        };

        let ema = if raw.ema.enable {
            let momentum = raw.ema.momentum;
            if !(momentum > 0.0 && momentum <= 1.0) {
                return Err(ConfigError::InvalidEmaMomentum(momentum));
            }
            Some(EmaSettings { momentum })
        } else {
            None
        };

        let horizon = HorizonPolicy::resolve(&raw.scheduler, Role::from_rank(start_rank));

        let exp_dir = raw.common.results_loc.join(&raw.common.run_label);
        let recovery = recovery_source(raw, &exp_dir);

        Ok(ResolvedRunConfig {
            run_label: raw.common.run_label.clone(),
            exp_dir,
            mode,
            num_gpus,
            distributed: DistributedSettings {
                world_size,
                start_rank,
                dist_url: raw.ddp.dist_url.clone(),
                dist_port: raw.ddp.dist_port,
                backend: raw.ddp.backend.clone(),
                find_unused_params: raw.ddp.find_unused_params,
            },
            data,
            normalization,
            horizon,
            ema,
            metric: MetricSettings {
                name: raw.stats.checkpoint_metric.clone(),
                polarity: if raw.stats.checkpoint_metric_max {
                    MetricPolarity::Maximize
                } else {
                    MetricPolarity::Minimize
                },
            },
            recovery,
            tracker: raw.tracker.enable.then(|| TrackerSettings {
                project: raw.tracker.project.clone(),
                tags: raw.tracker.tags.clone(),
            }),
            mixed_precision: raw.common.mixed_precision,
            channels_last: raw.common.channels_last,
        })
    }
}

fn recovery_source(raw: &RawRunConfig, exp_dir: &Path) -> RecoverySource {
    if let Some(resume) = &raw.common.resume {
        RecoverySource::Resume(resume.clone())
    } else if raw.common.auto_resume {
        RecoverySource::AutoResume(exp_dir.join(CHECKPOINT_FILENAME))
    } else if let Some(finetune) = &raw.common.finetune {
        RecoverySource::FineTune(finetune.clone())
    } else {
        RecoverySource::Fresh
    }
}
