//! Getting worker processes onto devices: picking ports, spawning one process per
//! GPU, joining them into a process group and binding each to its device.

mod binder;
mod launch;
mod port;
mod rendezvous;
mod runtime;

pub use binder::{BindError, DeviceBinder};
pub use launch::{
    ExecSpawner, LaunchError, LaunchOutcome, LaunchPlan, ProcessLauncher, WorkerExit,
    WorkerSpawner, WORKER_PLAN_ENV,
};
pub use port::{PortAllocator, PortError, DEFAULT_PORT_ATTEMPTS};
pub use rendezvous::{ProcessGroup, RendezvousError, TcpRendezvous};
pub use runtime::{cpu_count, detect_host, AcceleratorRuntime, NvmlRuntime, StaticRuntime};
