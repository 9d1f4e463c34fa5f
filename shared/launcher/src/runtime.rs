use kiln_core::HostProfile;
use nvml_wrapper::Nvml;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::{info, warn};

/// The accelerator driver as seen from this process.
pub trait AcceleratorRuntime: Send + Sync {
    fn is_available(&self) -> bool;

    fn device_count(&self) -> usize;

    /// Names of the visible devices, in index order.
    fn device_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// NVML-backed runtime. Loading the driver library happens at runtime, so this
/// works (and reports no devices) on hosts without NVIDIA drivers.
pub struct NvmlRuntime {
    nvml: Option<Nvml>,
}

impl NvmlRuntime {
    pub fn init() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(err) => {
                info!("NVML not available, assuming no GPUs: {err}");
                None
            }
        };
        Self { nvml }
    }
}

impl AcceleratorRuntime for NvmlRuntime {
    fn is_available(&self) -> bool {
        self.device_count() > 0
    }

    fn device_count(&self) -> usize {
        self.nvml
            .as_ref()
            .and_then(|nvml| nvml.device_count().ok())
            .unwrap_or(0) as usize
    }

    fn device_names(&self) -> Vec<String> {
        let Some(nvml) = &self.nvml else {
            return Vec::new();
        };
        (0..self.device_count() as u32)
            .filter_map(|i| nvml.device_by_index(i).and_then(|d| d.name()).ok())
            .collect()
    }
}

/// Runtime with a fixed device count, for hosts known to have no driver and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticRuntime {
    pub device_count: usize,
}

impl AcceleratorRuntime for StaticRuntime {
    fn is_available(&self) -> bool {
        self.device_count > 0
    }

    fn device_count(&self) -> usize {
        self.device_count
    }
}

pub fn cpu_count() -> usize {
    let system = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    match system.cpus().len() {
        0 => {
            warn!("Couldn't detect CPU count, assuming 1");
            1
        }
        n => n,
    }
}

pub fn detect_host(runtime: &dyn AcceleratorRuntime) -> HostProfile {
    let profile = HostProfile {
        num_gpus: runtime.device_count(),
        cpu_count: cpu_count(),
        accelerator_available: runtime.is_available(),
    };
    let names = runtime.device_names();
    if let Some(first) = names.first() {
        if !names.iter().all(|name| name == first) {
            warn!(?names, "GPUs on this host are not all the same type");
        }
    }
    info!(
        num_gpus = profile.num_gpus,
        cpu_count = profile.cpu_count,
        gpu = names.first().map(String::as_str).unwrap_or("none"),
        "Detected host"
    );
    profile
}
