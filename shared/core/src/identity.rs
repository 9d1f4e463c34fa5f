use crate::{device::Device, resolve::ResolvedRunConfig};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether this worker may perform run-wide side effects
/// (directory creation, experiment tracking, master-only logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Worker,
}

impl Role {
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 {
            Role::Leader
        } else {
            Role::Worker
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Worker => f.write_str("worker"),
        }
    }
}

/// Who this process is within the run. Built once per worker, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    rank: usize,
    device_id: Option<usize>,
    world_size: usize,
    device: Device,
    role: Role,
}

impl WorkerIdentity {
    pub fn new(rank: usize, device_id: Option<usize>, world_size: usize, device: Device) -> Self {
        Self {
            rank,
            device_id,
            world_size: world_size.max(1),
            device,
            role: Role::from_rank(rank),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device_id(&self) -> Option<usize> {
        self.device_id
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }
}

/// Everything a spawned worker needs, computed by the parent before spawning.
///
/// Workers read nothing else: no ambient config, no re-derived port or rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLaunchPlan {
    pub local_index: usize,
    /// Pre-assigned global rank. When absent the worker uses `start_rank + local_index`.
    pub rank: Option<usize>,
    pub start_rank: usize,
    pub device_id: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub config: ResolvedRunConfig,
}

impl WorkerLaunchPlan {
    pub fn expected_rank(&self) -> usize {
        self.rank.unwrap_or(self.start_rank + self.local_index)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_zero_leads() {
        let leader = WorkerIdentity::new(0, Some(0), 4, Device::Cuda(0));
        let worker = WorkerIdentity::new(3, Some(3), 4, Device::Cuda(3));
        assert_eq!(leader.role(), Role::Leader);
        assert!(leader.is_leader());
        assert_eq!(worker.role(), Role::Worker);
        assert_eq!(worker.device(), Device::Cuda(3));
    }

    #[test]
    fn world_size_is_at_least_one() {
        let identity = WorkerIdentity::new(0, None, 0, Device::Cpu);
        assert_eq!(identity.world_size(), 1);
    }
}
