use crate::{config::SchedulerSection, identity::Role};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_EPOCHS: u64 = 300;
pub const DEFAULT_ITERATIONS: u64 = 300_000;
/// Bound placed on the inactive dimension, large enough to never end a run first.
pub const DEFAULT_MAX_EPOCHS: u64 = 10_000_000;
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000_000;

/// How long a run trains for. Exactly one dimension is operative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingHorizon {
    EpochBased { max_epochs: u64 },
    IterationBased { max_iterations: u64 },
}

impl TrainingHorizon {
    pub fn max_epochs(&self) -> u64 {
        match self {
            TrainingHorizon::EpochBased { max_epochs } => *max_epochs,
            TrainingHorizon::IterationBased { .. } => DEFAULT_MAX_EPOCHS,
        }
    }

    pub fn max_iterations(&self) -> u64 {
        match self {
            TrainingHorizon::EpochBased { .. } => DEFAULT_MAX_ITERATIONS,
            TrainingHorizon::IterationBased { max_iterations } => *max_iterations,
        }
    }

    /// True once the operative bound has been reached. The other counter is ignored.
    pub fn is_finished(&self, epoch: u64, iteration: u64) -> bool {
        match self {
            TrainingHorizon::EpochBased { max_epochs } => epoch >= *max_epochs,
            TrainingHorizon::IterationBased { max_iterations } => iteration >= *max_iterations,
        }
    }
}

pub struct HorizonPolicy;

impl HorizonPolicy {
    pub fn resolve(scheduler: &SchedulerSection, role: Role) -> TrainingHorizon {
        if scheduler.is_iteration_based {
            let max_iterations =
                positive_or_default(scheduler.max_iterations, DEFAULT_ITERATIONS, "iterations");
            if role.is_leader() {
                info!(max_iterations, "Max. iteration for training: {max_iterations}");
            }
            TrainingHorizon::IterationBased { max_iterations }
        } else {
            let max_epochs = positive_or_default(scheduler.max_epochs, DEFAULT_EPOCHS, "epochs");
            if role.is_leader() {
                info!(max_epochs, "Max. epochs for training: {max_epochs}");
            }
            TrainingHorizon::EpochBased { max_epochs }
        }
    }
}

fn positive_or_default(value: Option<i64>, default: u64, what: &str) -> u64 {
    match value {
        Some(value) if value > 0 => value as u64,
        _ => {
            warn!(requested = ?value, "Setting max. {what} to {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn scheduler(
        iteration_based: bool,
        epochs: Option<i64>,
        iters: Option<i64>,
    ) -> SchedulerSection {
        SchedulerSection {
            is_iteration_based: iteration_based,
            max_epochs: epochs,
            max_iterations: iters,
        }
    }

    #[rstest]
    #[case(None, DEFAULT_EPOCHS)]
    #[case(Some(0), DEFAULT_EPOCHS)]
    #[case(Some(-5), DEFAULT_EPOCHS)]
    #[case(Some(90), 90)]
    fn epoch_based(#[case] requested: Option<i64>, #[case] expected: u64) {
        let horizon = HorizonPolicy::resolve(&scheduler(false, requested, Some(7)), Role::Leader);
        assert_eq!(horizon, TrainingHorizon::EpochBased { max_epochs: expected });
        assert_eq!(horizon.max_epochs(), expected);
        assert_eq!(horizon.max_iterations(), DEFAULT_MAX_ITERATIONS);
    }

    #[rstest]
    #[case(None, DEFAULT_ITERATIONS)]
    #[case(Some(0), DEFAULT_ITERATIONS)]
    #[case(Some(1200), 1200)]
    fn iteration_based(#[case] requested: Option<i64>, #[case] expected: u64) {
        let horizon = HorizonPolicy::resolve(&scheduler(true, Some(3), requested), Role::Worker);
        assert_eq!(
            horizon,
            TrainingHorizon::IterationBased {
                max_iterations: expected
            }
        );
        assert_eq!(horizon.max_iterations(), expected);
        assert_eq!(horizon.max_epochs(), DEFAULT_MAX_EPOCHS);
    }

    #[test]
    fn inactive_dimension_never_ends_the_run_first() {
        let epochs = TrainingHorizon::EpochBased { max_epochs: 300 };
        assert!(!epochs.is_finished(299, DEFAULT_ITERATIONS * 10));
        assert!(epochs.is_finished(300, 0));

        let iterations = TrainingHorizon::IterationBased {
            max_iterations: DEFAULT_ITERATIONS,
        };
        assert!(!iterations.is_finished(100_000, DEFAULT_ITERATIONS - 1));
        assert!(iterations.is_finished(0, DEFAULT_ITERATIONS));
    }

    #[test]
    fn long_epoch_run_outlives_the_iteration_bound() {
        let epochs = TrainingHorizon::EpochBased { max_epochs: 300 };
        assert!(!epochs.is_finished(250, 10_009_000));
        assert!(!epochs.is_finished(299, u64::MAX));

        let iterations = TrainingHorizon::IterationBased {
            max_iterations: 1000,
        };
        assert!(!iterations.is_finished(DEFAULT_MAX_EPOCHS + 5, 999));
    }
}
