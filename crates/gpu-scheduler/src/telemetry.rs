//! Hardware telemetry interface
//!
//! The scheduler depends only on this narrow contract; the NVML-backed
//! implementation is the single place that talks to the management library.

use anyhow::{Context, Result};
use api_types::GpuId;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;

/// NVML's upper bound on NVLink links per device
const NVLINK_MAX_LINKS: u32 = 18;

/// Device memory counters in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
}

/// Narrow view of the GPU management library
pub trait GpuTelemetry: Send + Sync {
    fn device_count(&self) -> Result<u32>;

    fn memory_info(&self, gpu: GpuId) -> Result<MemoryInfo>;

    /// Device utilization percentage (0-100)
    fn utilization(&self, gpu: GpuId) -> Result<u32>;

    /// Core temperature in celsius
    fn temperature(&self, gpu: GpuId) -> Result<u32>;

    /// Directly interconnected peer devices
    fn topology_peers(&self, gpu: GpuId) -> Result<Vec<GpuId>>;
}

/// Production telemetry over NVML
pub struct NvmlTelemetry {
    nvml: Nvml,
}

impl NvmlTelemetry {
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().context("initialize NVML")?;
        Ok(Self { nvml })
    }
}

impl GpuTelemetry for NvmlTelemetry {
    fn device_count(&self) -> Result<u32> {
        Ok(self.nvml.device_count()?)
    }

    fn memory_info(&self, gpu: GpuId) -> Result<MemoryInfo> {
        let device = self.nvml.device_by_index(gpu)?;
        let memory = device.memory_info()?;
        Ok(MemoryInfo {
            total: memory.total,
            used: memory.used,
        })
    }

    fn utilization(&self, gpu: GpuId) -> Result<u32> {
        let device = self.nvml.device_by_index(gpu)?;
        Ok(device.utilization_rates()?.gpu)
    }

    fn temperature(&self, gpu: GpuId) -> Result<u32> {
        let device = self.nvml.device_by_index(gpu)?;
        Ok(device.temperature(TemperatureSensor::Gpu)?)
    }

    fn topology_peers(&self, gpu: GpuId) -> Result<Vec<GpuId>> {
        let device = self.nvml.device_by_index(gpu)?;

        // map PCI bus ids to device indices once, then resolve the remote
        // end of every active link
        let count = self.nvml.device_count()?;
        let mut bus_to_index = std::collections::HashMap::new();
        for index in 0..count {
            let pci = self
                .nvml
                .device_by_index(index)?
                .pci_info()
                .with_context(|| format!("pci info of device {index}"))?;
            bus_to_index.insert(pci.bus_id, index);
        }

        let mut peers = Vec::new();
        for link in 0..NVLINK_MAX_LINKS {
            let nv_link = device.link_wrapper_for(link);
            if !matches!(nv_link.is_active(), Ok(true)) {
                continue;
            }
            // the remote end may be a switch or CPU rather than a GPU
            let Ok(remote) = nv_link.remote_pci_info() else {
                continue;
            };
            if let Some(&peer) = bus_to_index.get(&remote.bus_id) {
                if peer != gpu && !peers.contains(&peer) {
                    peers.push(peer);
                }
            }
        }
        Ok(peers)
    }
}
