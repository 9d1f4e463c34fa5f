use crate::{
    rendezvous::{ProcessGroup, RendezvousError},
    runtime::AcceleratorRuntime,
};
use kiln_core::{Device, WorkerIdentity, WorkerLaunchPlan};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("no accelerator runtime available, can't bind worker {local_index} to a GPU")]
    AcceleratorUnavailable { local_index: usize },

    #[error("device {device_id} requested but only {available} visible")]
    DeviceOutOfRange { device_id: usize, available: usize },

    #[error("this process is already bound to {0}")]
    AlreadyBound(Device),

    #[error("process group join failed: {0}")]
    Rendezvous(#[from] RendezvousError),
}

/// Binds a spawned worker to its device and joins it into the process group.
///
/// A binder hands out exactly one identity; the worker keeps it for the rest of
/// its life.
pub struct DeviceBinder {
    runtime: Arc<dyn AcceleratorRuntime>,
    bound: OnceLock<WorkerIdentity>,
}

impl DeviceBinder {
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>) -> Self {
        Self {
            runtime,
            bound: OnceLock::new(),
        }
    }

    pub fn identity(&self) -> Option<&WorkerIdentity> {
        self.bound.get()
    }

    pub async fn bind(
        &self,
        plan: &WorkerLaunchPlan,
        group: &dyn ProcessGroup,
    ) -> Result<WorkerIdentity, BindError> {
        if let Some(identity) = self.bound.get() {
            return Err(BindError::AlreadyBound(identity.device()));
        }
        if !self.runtime.is_available() {
            return Err(BindError::AcceleratorUnavailable {
                local_index: plan.local_index,
            });
        }
        let available = self.runtime.device_count();
        if plan.device_id >= available {
            return Err(BindError::DeviceOutOfRange {
                device_id: plan.device_id,
                available,
            });
        }
        let device = Device::Cuda(plan.device_id);

        let rank = plan.expected_rank();
        info!(
            rank,
            local_index = plan.local_index,
            %device,
            world_size = plan.world_size,
            "Joining process group"
        );
        let node_rank = group.join(rank, plan.world_size).await?;
        if node_rank != rank {
            info!(rank, node_rank, "Process group assigned a different rank");
        }

        let identity =
            WorkerIdentity::new(node_rank, Some(plan.device_id), plan.world_size, device);
        self.bound
            .set(identity.clone())
            .map_err(|_| BindError::AlreadyBound(device))?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticRuntime;
    use async_trait::async_trait;
    use kiln_core::{ConfigResolver, HostProfile, RawRunConfig, Role};

    /// Confirms whatever rank it's asked for, shifted by `offset`.
    struct FakeGroup {
        offset: usize,
    }

    #[async_trait]
    impl ProcessGroup for FakeGroup {
        async fn join(&self, rank: usize, _world_size: usize) -> Result<usize, RendezvousError> {
            Ok(rank + self.offset)
        }
    }

    fn plan(local_index: usize, rank: Option<usize>, start_rank: usize) -> WorkerLaunchPlan {
        let config = ConfigResolver::resolve(
            &RawRunConfig::default(),
            &HostProfile {
                num_gpus: 4,
                cpu_count: 8,
                accelerator_available: true,
            },
        )
        .unwrap();
        WorkerLaunchPlan {
            local_index,
            rank,
            start_rank,
            device_id: local_index,
            world_size: 8,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            config,
        }
    }

    fn binder(device_count: usize) -> DeviceBinder {
        DeviceBinder::new(Arc::new(StaticRuntime { device_count }))
    }

    #[tokio::test]
    async fn binds_device_matching_local_index() {
        let binder = binder(4);
        let identity = binder
            .bind(&plan(2, Some(2), 0), &FakeGroup { offset: 0 })
            .await
            .unwrap();
        assert_eq!(identity.device(), Device::Cuda(2));
        assert_eq!(identity.device_id(), Some(2));
        assert_eq!(identity.rank(), 2);
        assert_eq!(identity.world_size(), 8);
        assert_eq!(identity.role(), Role::Worker);
        assert_eq!(binder.identity(), Some(&identity));
    }

    #[tokio::test]
    async fn computes_rank_from_start_rank_when_unassigned() {
        let identity = binder(4)
            .bind(&plan(1, None, 4), &FakeGroup { offset: 0 })
            .await
            .unwrap();
        assert_eq!(identity.rank(), 5);
    }

    #[tokio::test]
    async fn group_rank_is_authoritative() {
        let identity = binder(4)
            .bind(&plan(0, Some(0), 0), &FakeGroup { offset: 4 })
            .await
            .unwrap();
        assert_eq!(identity.rank(), 4);
        assert!(!identity.is_leader());
    }

    #[tokio::test]
    async fn binds_only_once() {
        let binder = binder(4);
        binder
            .bind(&plan(0, Some(0), 0), &FakeGroup { offset: 0 })
            .await
            .unwrap();
        let err = binder
            .bind(&plan(1, Some(1), 0), &FakeGroup { offset: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::AlreadyBound(Device::Cuda(0))));
    }

    #[tokio::test]
    async fn missing_runtime_or_device_is_fatal() {
        let err = binder(0)
            .bind(&plan(0, Some(0), 0), &FakeGroup { offset: 0 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BindError::AcceleratorUnavailable { local_index: 0 }
        ));

        let err = binder(2)
            .bind(&plan(3, Some(3), 0), &FakeGroup { offset: 0 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BindError::DeviceOutOfRange {
                device_id: 3,
                available: 2
            }
        ));
    }
}
