//! # Compute Device Selection
//!
//! Maps `models.device` to a candle `Device`. Accelerators that are asked
//! for but not present fall back to the CPU with a warning, so a
//! misconfigured GPU box still serves requests.

use candle_core::Device;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

static AUTO_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// First of CUDA, Metal, CPU that works
    Auto,
    #[default]
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            other => Err(format!("unknown device '{}', expected auto, cpu, cuda or metal", other)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    pub fn select(preference: DevicePreference) -> Device {
        let device = match preference {
            DevicePreference::Auto => AUTO_DEVICE.get_or_init(Self::detect).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::cuda().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, using CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::metal().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, using CPU");
                Device::Cpu
            }),
        };
        info!(?preference, device = Self::describe(&device), "Inference device selected");
        device
    }

    fn detect() -> Device {
        Self::cuda().or_else(Self::metal).unwrap_or(Device::Cpu)
    }

    fn cuda() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!(error = %e, "CUDA not available"))
            .ok()
    }

    fn metal() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!(error = %e, "Metal not available"))
            .ok()
    }

    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}
