mod config;
mod device;
mod horizon;
mod identity;
mod mode;
mod resolve;

pub use config::{
    CommonSection, ConfigLoadError, DatasetSection, DdpSection, DevSection, EmaSection,
    ModelSection, NormalizationSection, RawRunConfig, SchedulerSection, StatsSection,
    TrackerSection,
};
pub use device::{Device, ParseDeviceError};
pub use horizon::{
    HorizonPolicy, TrainingHorizon, DEFAULT_EPOCHS, DEFAULT_ITERATIONS, DEFAULT_MAX_EPOCHS,
    DEFAULT_MAX_ITERATIONS,
};
pub use identity::{Role, WorkerIdentity, WorkerLaunchPlan};
pub use mode::{ExecutionMode, ModeRequest};
pub use resolve::{
    ConfigError, ConfigResolver, DataSettings, DistributedSettings, EmaSettings, HostProfile,
    MetricPolarity, MetricSettings, RecoverySource, ResolvedRunConfig, TrackerSettings,
    CHECKPOINT_FILENAME,
};
