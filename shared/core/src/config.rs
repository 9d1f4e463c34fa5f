//! Raw run configuration, as written by the operator.
//!
//! Every section mirrors one dotted-key namespace of a run file (`dev.num_gpus`,
//! `ddp.world_size`, ...). Nothing here is resolved yet: fields are optional and
//! `-1` sentinels are still allowed where older run files used them. Turn this into
//! a [`crate::ResolvedRunConfig`] with [`crate::ConfigResolver`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawRunConfig {
    pub common: CommonSection,
    pub dev: DevSection,
    pub ddp: DdpSection,
    pub dataset: DatasetSection,
    pub model: ModelSection,
    pub scheduler: SchedulerSection,
    pub ema: EmaSection,
    pub stats: StatsSection,
    pub tracker: TrackerSection,
}

impl RawRunConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommonSection {
    pub results_loc: PathBuf,
    pub run_label: String,
    /// Full checkpoint to resume from.
    pub resume: Option<PathBuf>,
    /// Weights-only seed for fine-tuning.
    pub finetune: Option<PathBuf>,
    /// Resume from `<results_loc>/<run_label>/checkpoint.safetensors` when it exists.
    pub auto_resume: bool,
    pub mixed_precision: bool,
    pub channels_last: bool,
}

impl Default for CommonSection {
    fn default() -> Self {
        Self {
            results_loc: PathBuf::from("results"),
            run_label: "run_1".to_string(),
            resume: None,
            finetune: None,
            auto_resume: false,
            mixed_precision: false,
            channels_last: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevSection {
    /// Overrides the detected GPU count.
    pub num_gpus: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DdpSection {
    pub disable: bool,
    pub no_spawn: bool,
    /// Rank offset of this node. Spawned workers get `rank + local_index`.
    pub rank: Option<i64>,
    /// `-1` or absent means "one worker per GPU on this node".
    pub world_size: Option<i64>,
    pub dist_url: String,
    /// Fixed rendezvous port. When absent a free port is allocated on the launching host.
    pub dist_port: Option<u16>,
    pub backend: String,
    pub find_unused_params: bool,
}

impl Default for DdpSection {
    fn default() -> Self {
        Self {
            disable: false,
            no_spawn: false,
            rank: None,
            world_size: None,
            dist_url: "127.0.0.1".to_string(),
            dist_port: None,
            backend: "nccl".to_string(),
            find_unused_params: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetSection {
    /// `-1` or absent means "derive from the CPU count".
    pub workers: Option<i64>,
    pub train_batch_size0: usize,
    pub val_batch_size0: usize,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            workers: None,
            train_batch_size0: 32,
            val_batch_size0: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub normalization: NormalizationSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizationSection {
    pub name: String,
}

impl Default for NormalizationSection {
    fn default() -> Self {
        Self {
            name: "batch_norm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub is_iteration_based: bool,
    pub max_epochs: Option<i64>,
    pub max_iterations: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmaSection {
    pub enable: bool,
    pub momentum: f64,
}

impl Default for EmaSection {
    fn default() -> Self {
        Self {
            enable: false,
            momentum: 0.0001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsSection {
    pub checkpoint_metric: String,
    /// `true` when a larger checkpoint metric is better.
    pub checkpoint_metric_max: bool,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            checkpoint_metric: "loss".to_string(),
            checkpoint_metric_max: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerSection {
    pub enable: bool,
    pub project: String,
    pub tags: Vec<String>,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            enable: false,
            project: "kiln".to_string(),
            tags: vec!["backbone".to_string()],
        }
    }
}
