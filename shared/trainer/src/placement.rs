use kiln_core::{Device, ExecutionMode, ResolvedRunConfig, WorkerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryFormat {
    Contiguous,
    ChannelsLast,
}

/// Where the model lives for this worker and how it is wrapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Host {
        memory_format: MemoryFormat,
    },
    Device {
        device: Device,
        memory_format: MemoryFormat,
    },
    /// One replica per process, gradients all-reduced across the process group.
    DistributedDataParallel {
        device: Device,
        world_size: usize,
        backend: String,
        find_unused_params: bool,
        memory_format: MemoryFormat,
    },
    /// One process, replicated over every device.
    DataParallel {
        devices: Vec<Device>,
        memory_format: MemoryFormat,
    },
}

impl Placement {
    pub fn for_worker(identity: &WorkerIdentity, config: &ResolvedRunConfig) -> Self {
        let memory_format = if config.channels_last {
            MemoryFormat::ChannelsLast
        } else {
            MemoryFormat::Contiguous
        };
        let leader = identity.is_leader();
        match config.mode {
            ExecutionMode::Cpu => Placement::Host { memory_format },
            ExecutionMode::SingleDevice => Placement::Device {
                device: identity.device(),
                memory_format,
            },
            ExecutionMode::ProcessGroupDistributed => {
                if leader {
                    info!(
                        backend = %config.distributed.backend,
                        "Using DistributedDataParallel"
                    );
                }
                Placement::DistributedDataParallel {
                    device: identity.device(),
                    world_size: identity.world_size(),
                    backend: config.distributed.backend.clone(),
                    find_unused_params: config.distributed.find_unused_params,
                    memory_format,
                }
            }
            ExecutionMode::LegacyDataParallel => {
                if leader {
                    info!(num_gpus = config.num_gpus, "Using DataParallel");
                }
                Placement::DataParallel {
                    devices: (0..config.num_gpus).map(Device::Cuda).collect(),
                    memory_format,
                }
            }
        }
    }

    /// Device holding the master copy of the parameters.
    pub fn primary_device(&self) -> Device {
        match self {
            Placement::Host { .. } => Device::Cpu,
            Placement::Device { device, .. } | Placement::DistributedDataParallel { device, .. } => {
                *device
            }
            Placement::DataParallel { devices, .. } => {
                devices.first().copied().unwrap_or(Device::Cpu)
            }
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Host { .. } => write!(f, "host"),
            Placement::Device { device, .. } => write!(f, "{device}"),
            Placement::DistributedDataParallel {
                device, world_size, ..
            } => write!(f, "ddp({device}, world size {world_size})"),
            Placement::DataParallel { devices, .. } => {
                write!(f, "dp(")?;
                for (i, device) in devices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{device}")?;
                }
                write!(f, ")")
            }
        }
    }
}
