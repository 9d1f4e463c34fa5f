use serde::{Deserialize, Serialize};
use std::fmt;

/// How a run is executed on this node. Selected once, before anything is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// No GPUs: the model stays in host memory.
    Cpu,
    /// Exactly one GPU, no replication.
    SingleDevice,
    /// One spawned worker process per GPU, joined into a process group.
    ProcessGroupDistributed,
    /// One process drives every GPU through in-process replication.
    LegacyDataParallel,
}

/// Inputs to [`ExecutionMode::select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    pub num_gpus: usize,
    pub distributed_disabled: bool,
    pub spawn_disabled: bool,
    pub accelerator_available: bool,
}

impl ExecutionMode {
    pub fn select(request: ModeRequest) -> Self {
        match request.num_gpus {
            0 => ExecutionMode::Cpu,
            1 => ExecutionMode::SingleDevice,
            _ if !request.distributed_disabled
                && !request.spawn_disabled
                && request.accelerator_available =>
            {
                ExecutionMode::ProcessGroupDistributed
            }
            _ => ExecutionMode::LegacyDataParallel,
        }
    }

    /// Whether gradients are synchronized through a process group.
    ///
    /// Always false for a single GPU or none, whatever the config asked for.
    pub fn uses_process_group(&self) -> bool {
        matches!(self, ExecutionMode::ProcessGroupDistributed)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Cpu => "cpu",
            ExecutionMode::SingleDevice => "single-device",
            ExecutionMode::ProcessGroupDistributed => "process-group-distributed",
            ExecutionMode::LegacyDataParallel => "legacy-data-parallel",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request(num_gpus: usize, disabled: bool, no_spawn: bool, runtime: bool) -> ModeRequest {
        ModeRequest {
            num_gpus,
            distributed_disabled: disabled,
            spawn_disabled: no_spawn,
            accelerator_available: runtime,
        }
    }

    #[rstest]
    #[case(0, false, false, true, ExecutionMode::Cpu)]
    #[case(0, false, false, false, ExecutionMode::Cpu)]
    #[case(1, false, false, true, ExecutionMode::SingleDevice)]
    #[case(1, true, true, false, ExecutionMode::SingleDevice)]
    #[case(4, false, false, true, ExecutionMode::ProcessGroupDistributed)]
    #[case(4, true, false, true, ExecutionMode::LegacyDataParallel)]
    #[case(4, false, true, true, ExecutionMode::LegacyDataParallel)]
    #[case(4, false, false, false, ExecutionMode::LegacyDataParallel)]
    fn selects_mode(
        #[case] num_gpus: usize,
        #[case] disabled: bool,
        #[case] no_spawn: bool,
        #[case] runtime: bool,
        #[case] expected: ExecutionMode,
    ) {
        assert_eq!(
            ExecutionMode::select(request(num_gpus, disabled, no_spawn, runtime)),
            expected
        );
    }

    #[test]
    fn process_group_never_used_with_one_gpu_or_fewer() {
        for num_gpus in 0..=1 {
            for disabled in [false, true] {
                for no_spawn in [false, true] {
                    for runtime in [false, true] {
                        let mode =
                            ExecutionMode::select(request(num_gpus, disabled, no_spawn, runtime));
                        assert!(!mode.uses_process_group());
                    }
                }
            }
        }
    }
}
