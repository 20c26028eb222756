//! GPU device discovery and information.
//!
//! Detects available GPUs and their VRAM capacity.
//! When compiled without the `cuda` feature, reports the simulated devices
//! from the configuration.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DeviceConfig;

/// Information about a single GPU device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name (e.g., "NVIDIA GeForce GTX 1070").
    pub name: String,

    /// Total VRAM in bytes.
    pub total_vram: usize,

    /// Whether this device is backed by host memory.
    pub simulated: bool,
}

/// Detect all available GPU devices.
///
/// With the `cuda` feature enabled, uses the CUDA driver to enumerate
/// devices and falls back to the simulated list when none are found.
pub fn detect_devices(config: &DeviceConfig) -> Vec<GpuDeviceInfo> {
    #[cfg(feature = "cuda")]
    {
        let devices = detect_devices_cuda();
        if !devices.is_empty() {
            return devices;
        }
    }

    info!(
        count = config.simulated.len(),
        "Using simulated GPU devices"
    );
    simulated_devices(config)
}

/// Device list described by the configuration.
pub fn simulated_devices(config: &DeviceConfig) -> Vec<GpuDeviceInfo> {
    config
        .simulated
        .iter()
        .map(|d| GpuDeviceInfo {
            id: d.id,
            name: d.name.clone(),
            total_vram: d.total_vram,
            simulated: true,
        })
        .collect()
}

#[cfg(feature = "cuda")]
fn detect_devices_cuda() -> Vec<GpuDeviceInfo> {
    use cudarc::driver::CudaContext;

    let count = match CudaContext::device_count() {
        Ok(n) => n.max(0) as usize,
        Err(e) => {
            tracing::warn!(error = ?e, "CUDA device enumeration failed");
            return Vec::new();
        }
    };

    (0..count)
        .filter_map(|ordinal| {
            let ctx = CudaContext::new(ordinal).ok()?;
            let name = ctx
                .name()
                .unwrap_or_else(|_| format!("CUDA device {ordinal}"));
            #[allow(unused_unsafe)]
            let total_vram =
                unsafe { cudarc::driver::result::device::total_mem(ctx.cu_device()) }.unwrap_or(0);
            Some(GpuDeviceInfo {
                id: ordinal,
                name,
                total_vram,
                simulated: false,
            })
        })
        .collect()
}
