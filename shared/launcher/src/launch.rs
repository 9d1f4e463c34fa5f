use crate::port::{PortAllocator, PortError};
use futures::{stream::FuturesUnordered, StreamExt};
use kiln_core::{Device, ExecutionMode, ResolvedRunConfig, WorkerIdentity, WorkerLaunchPlan};
use std::{ffi::OsString, path::PathBuf, process::Stdio};
use thiserror::Error;
use tokio::{process::Command, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Environment variable a spawned worker finds its [`WorkerLaunchPlan`] in, as JSON.
pub const WORKER_PLAN_ENV: &str = "KILN_WORKER_PLAN";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("couldn't allocate a rendezvous port: {0}")]
    Port(#[from] PortError),

    #[error("couldn't serialize launch plan: {0}")]
    Plan(#[from] serde_json::Error),

    #[error("failed to spawn worker rank {rank}: {source}")]
    Spawn {
        rank: usize,
        source: std::io::Error,
    },

    #[error("lost track of worker rank {rank}: {source}")]
    WorkerLost {
        rank: usize,
        source: std::io::Error,
    },

    #[error("worker rank {rank} exited with status {code:?}")]
    WorkerFailed { rank: usize, code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failed(Option<i32>),
}

/// What the launcher decided to do on this node.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchPlan {
    /// Train in this process.
    InProcess { identity: WorkerIdentity },
    /// Spawn one process per plan; all rendezvous at `master_addr:master_port`.
    Spawn {
        master_addr: String,
        master_port: u16,
        workers: Vec<WorkerLaunchPlan>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    RunInProcess(WorkerIdentity),
    WorkersFinished { workers: usize },
}

/// Starts one worker process from its plan.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        plan: &WorkerLaunchPlan,
    ) -> Result<JoinHandle<std::io::Result<WorkerExit>>, LaunchError>;
}

/// Re-executes a binary (by default the current one) once per worker, handing it
/// its plan through [`WORKER_PLAN_ENV`] plus the usual `RANK` / `WORLD_SIZE` /
/// `MASTER_ADDR` / `MASTER_PORT` variables for collective libraries.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecSpawner {
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(
        &self,
        plan: &WorkerLaunchPlan,
    ) -> Result<JoinHandle<std::io::Result<WorkerExit>>, LaunchError> {
        let rank = plan.expected_rank();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_PLAN_ENV, plan.to_json()?)
            .env("RANK", rank.to_string())
            .env("LOCAL_RANK", plan.local_index.to_string())
            .env("WORLD_SIZE", plan.world_size.to_string())
            .env("MASTER_ADDR", &plan.master_addr)
            .env("MASTER_PORT", plan.master_port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn { rank, source })?;
        debug!(rank, pid = ?child.id(), "Spawned worker");

        Ok(tokio::spawn(async move {
            let status = child.wait().await?;
            Ok(if status.success() {
                WorkerExit::Success
            } else {
                WorkerExit::Failed(status.code())
            })
        }))
    }
}

pub struct ProcessLauncher<S> {
    spawner: S,
    ports: PortAllocator,
}

impl<S: WorkerSpawner> ProcessLauncher<S> {
    pub fn new(spawner: S) -> Self {
        Self {
            spawner,
            ports: PortAllocator::default(),
        }
    }

    /// Decide what runs where. Port and ranks are fixed here, before anything is spawned.
    ///
    /// A run that stays in this process is its own leader, whatever `ddp.rank` says.
    pub fn plan(&self, config: &ResolvedRunConfig) -> Result<LaunchPlan, LaunchError> {
        let identity = match config.mode {
            ExecutionMode::Cpu => {
                warn!(
                    "No GPUs are available, so training on CPU. \
                     Consider training on GPU for faster training"
                );
                WorkerIdentity::new(0, None, 1, Device::Cpu)
            }
            ExecutionMode::SingleDevice => WorkerIdentity::new(0, Some(0), 1, Device::Cuda(0)),
            ExecutionMode::LegacyDataParallel => WorkerIdentity::new(0, None, 1, Device::Cuda(0)),
            ExecutionMode::ProcessGroupDistributed => return self.plan_spawn(config),
        };
        Ok(LaunchPlan::InProcess { identity })
    }

    fn plan_spawn(&self, config: &ResolvedRunConfig) -> Result<LaunchPlan, LaunchError> {
        let master_port = match config.distributed.dist_port {
            Some(port) => port,
            None => self.ports.allocate()?,
        };
        let master_addr = config.distributed.dist_url.clone();
        let start_rank = config.distributed.start_rank;
        let workers = (0..config.num_gpus)
            .map(|local_index| WorkerLaunchPlan {
                local_index,
                rank: Some(start_rank + local_index),
                start_rank,
                device_id: local_index,
                world_size: config.distributed.world_size,
                master_addr: master_addr.clone(),
                master_port,
                config: config.clone(),
            })
            .collect();
        Ok(LaunchPlan::Spawn {
            master_addr,
            master_port,
            workers,
        })
    }

    pub async fn launch(&self, config: &ResolvedRunConfig) -> Result<LaunchOutcome, LaunchError> {
        match self.plan(config)? {
            LaunchPlan::InProcess { identity } => {
                info!(
                    mode = %config.mode,
                    rank = identity.rank(),
                    device = %identity.device(),
                    "Training in this process"
                );
                Ok(LaunchOutcome::RunInProcess(identity))
            }
            LaunchPlan::Spawn {
                master_addr,
                master_port,
                workers,
            } => {
                info!(
                    num_workers = workers.len(),
                    world_size = config.distributed.world_size,
                    start_rank = config.distributed.start_rank,
                    %master_addr,
                    master_port,
                    "Spawning distributed workers"
                );
                let mut handles = Vec::with_capacity(workers.len());
                for plan in &workers {
                    handles.push((plan.expected_rank(), self.spawner.spawn(plan)?));
                }
                wait_for_workers(handles).await?;
                Ok(LaunchOutcome::WorkersFinished {
                    workers: workers.len(),
                })
            }
        }
    }
}

/// Waits for every worker. Returns on the first failure; the remaining children
/// are killed when their handles are dropped along with the runtime.
async fn wait_for_workers(
    handles: Vec<(usize, JoinHandle<std::io::Result<WorkerExit>>)>,
) -> Result<(), LaunchError> {
    let mut pending = handles
        .into_iter()
        .map(|(rank, handle)| async move { (rank, handle.await) })
        .collect::<FuturesUnordered<_>>();

    while let Some((rank, joined)) = pending.next().await {
        let exit = match joined {
            Ok(Ok(exit)) => exit,
            Ok(Err(source)) => return Err(LaunchError::WorkerLost { rank, source }),
            Err(join_err) => {
                return Err(LaunchError::WorkerLost {
                    rank,
                    source: std::io::Error::other(join_err),
                })
            }
        };
        match exit {
            WorkerExit::Success => debug!(rank, "Worker exited cleanly"),
            WorkerExit::Failed(code) => {
                error!(rank, ?code, "Worker failed");
                return Err(LaunchError::WorkerFailed { rank, code });
            }
        }
    }
    Ok(())
}
