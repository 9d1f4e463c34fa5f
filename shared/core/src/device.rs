use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Logical device a worker's model lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseDeviceError {
    #[error("Invalid CUDA device ID in {0:?}")]
    InvalidCudaId(String),

    #[error("Invalid device: {0}. Supported: cpu, cuda, cuda:N")]
    Unknown(String),
}

/// Parse device string into [`Device`]
///
/// Supported formats:
/// - "cpu" -> Device::Cpu
/// - "cuda" -> Device::Cuda(0)
/// - "cuda:N" -> Device::Cuda(N)
impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            lower if lower.starts_with("cuda:") => lower["cuda:".len()..]
                .parse::<usize>()
                .map(Device::Cuda)
                .map_err(|_| ParseDeviceError::InvalidCudaId(s.to_string())),
            _ => Err(ParseDeviceError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = ParseDeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}
