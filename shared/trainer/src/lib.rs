mod dummy;
mod placement;
mod session;
mod supervisor;
mod tracker;
mod traits;

pub use dummy::{
    get_dummy_parameters, CosineSchedule, DummyCollaborators, DummyModel, DummyTrainingLoop,
    MseLoss, Sgd, ShardedSampler, SyntheticData,
};
pub use placement::{MemoryFormat, Placement};
pub use session::TrainingSession;
pub use supervisor::{Collaborators, RunSupervisor, SupervisorError};
pub use tracker::{ExperimentTracker, FileTracker, TrackerRun};
pub use traits::{
    Batch, ComponentFactory, Criterion, DataFactory, DataLoader, DataLoaders, LrSchedule,
    ModelFactory, Optimizer, Sampler, TrainableModel, TrainingComponents, TrainingLoop,
};
