//! GPU pool registry
//!
//! Single source of truth for device capacity, usage, topology and health.
//! Mutated by the allocation path (usage, active sets) and the health monitor
//! (health state, telemetry bookkeeping); everything else reads snapshots.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use api_types::{GpuId, TaskId};

use crate::telemetry::GpuTelemetry;

/// Device health as judged by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum HealthState {
    /// Fully allocatable
    Healthy,
    /// Running tasks stay, but the device receives no new allocations
    Degraded,
    /// Excluded from allocation; active tasks are reassigned
    Failed,
}

/// One GPU in the pool
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub id: GpuId,
    /// Total VRAM in bytes
    pub total_vram: u64,
    /// Sum of `vram_required` of tasks currently allocated here
    pub used_vram: u64,
    /// Devices this one is directly NVLink-connected to
    pub nvlink_peers: HashSet<GpuId>,
    pub health: HealthState,
    pub active_tasks: HashSet<TaskId>,
    /// Latest sampler readings
    pub last_utilization: u32,
    pub last_memory_used: u64,
    pub last_temperature: u32,
    /// Rolling telemetry error counter, reset on recovery
    pub error_count: u32,
    /// Consecutive in-limits samples, feeds Failed -> Healthy recovery
    pub healthy_samples: u32,
    /// When the device entered Failed
    pub failed_at: Option<Instant>,
}

impl GpuDevice {
    pub fn new(id: GpuId, total_vram: u64, nvlink_peers: HashSet<GpuId>) -> Self {
        Self {
            id,
            total_vram,
            used_vram: 0,
            nvlink_peers,
            health: HealthState::Healthy,
            active_tasks: HashSet::new(),
            last_utilization: 0,
            last_memory_used: 0,
            last_temperature: 0,
            error_count: 0,
            healthy_samples: 0,
            failed_at: None,
        }
    }

    pub fn free_vram(&self) -> u64 {
        self.total_vram.saturating_sub(self.used_vram)
    }
}

/// The device table, keyed by device index
#[derive(Debug, Default)]
pub struct GpuPool {
    devices: BTreeMap<GpuId, GpuDevice>,
}

impl GpuPool {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    /// Enumerate the hardware once at startup
    pub fn from_telemetry(telemetry: &dyn GpuTelemetry) -> Result<Self> {
        let count = telemetry.device_count().context("query device count")?;
        let mut devices = Vec::with_capacity(count as usize);
        for id in 0..count {
            let memory = telemetry
                .memory_info(id)
                .with_context(|| format!("query memory of device {id}"))?;
            let peers = telemetry
                .topology_peers(id)
                .with_context(|| format!("query topology of device {id}"))?;
            devices.push(GpuDevice::new(id, memory.total, peers.into_iter().collect()));
        }
        tracing::info!(device_count = devices.len(), "GPU pool enumerated");
        Ok(Self::new(devices))
    }

    /// Best-fit allocation. Filters to healthy devices with enough free VRAM
    /// and commits the task to the best candidate, ordered by NVLink peer
    /// count, then free VRAM, then active task count, then device id for
    /// determinism. Never splits a requirement across devices.
    pub fn allocate(&mut self, task: TaskId, vram_required: u64) -> Option<GpuId> {
        let mut candidates: Vec<&GpuDevice> = self
            .devices
            .values()
            .filter(|d| d.health == HealthState::Healthy && d.free_vram() >= vram_required)
            .collect();
        candidates.sort_by(|a, b| {
            b.nvlink_peers
                .len()
                .cmp(&a.nvlink_peers.len())
                .then(b.free_vram().cmp(&a.free_vram()))
                .then(a.active_tasks.len().cmp(&b.active_tasks.len()))
                .then(a.id.cmp(&b.id))
        });
        let gpu = candidates.first().map(|d| d.id)?;
        self.commit(gpu, task, vram_required);
        Some(gpu)
    }

    /// Commit a task onto a specific device if it is healthy and fits.
    /// Used when retrying onto the device set a preemption plan freed.
    pub fn allocate_on(&mut self, gpu: GpuId, task: TaskId, vram_required: u64) -> bool {
        let fits = self
            .devices
            .get(&gpu)
            .map(|d| d.health == HealthState::Healthy && d.free_vram() >= vram_required)
            .unwrap_or(false);
        if fits {
            self.commit(gpu, task, vram_required);
        }
        fits
    }

    fn commit(&mut self, gpu: GpuId, task: TaskId, vram_required: u64) {
        let device = self.devices.get_mut(&gpu).expect("candidate device exists");
        device.used_vram += vram_required;
        device.active_tasks.insert(task);
        tracing::debug!(
            task = %task,
            gpu,
            vram_required,
            free_vram = device.free_vram(),
            "allocation committed"
        );
    }

    /// Free a task's allocation. Safe to call for tasks that hold none.
    /// Returns the device the task was released from.
    pub fn release(&mut self, task: &TaskId, vram_required: u64) -> Option<GpuId> {
        let device = self
            .devices
            .values_mut()
            .find(|d| d.active_tasks.contains(task))?;
        device.active_tasks.remove(task);
        device.used_vram = device.used_vram.saturating_sub(vram_required);
        tracing::debug!(task = %task, gpu = device.id, "allocation released");
        Some(device.id)
    }

    /// Health transitions, driven by the health monitor only
    pub fn mark_health(&mut self, gpu: GpuId, state: HealthState) {
        if let Some(device) = self.devices.get_mut(&gpu) {
            if device.health != state {
                tracing::info!(gpu, from = %device.health, to = %state, "device health changed");
            }
            device.health = state;
            device.failed_at = (state == HealthState::Failed).then(Instant::now);
        }
    }

    pub fn device(&self, gpu: GpuId) -> Option<&GpuDevice> {
        self.devices.get(&gpu)
    }

    pub fn device_mut(&mut self, gpu: GpuId) -> Option<&mut GpuDevice> {
        self.devices.get_mut(&gpu)
    }

    pub fn devices(&self) -> impl Iterator<Item = &GpuDevice> {
        self.devices.values()
    }

    pub fn device_ids(&self) -> Vec<GpuId> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn pool(devices: Vec<GpuDevice>) -> GpuPool {
        GpuPool::new(devices)
    }

    fn device(id: GpuId, total: u64, peers: &[GpuId]) -> GpuDevice {
        GpuDevice::new(id, total, peers.iter().copied().collect())
    }

    #[test]
    fn allocation_prefers_nvlink_rich_devices() {
        let mut pool = pool(vec![
            device(0, 24 * GIB, &[]),
            device(1, 24 * GIB, &[2]),
            device(2, 24 * GIB, &[1]),
        ]);
        let gpu = pool.allocate(TaskId::new(), 4 * GIB).unwrap();
        assert_eq!(gpu, 1, "peer count beats free vram, id breaks the tie");
    }

    #[test]
    fn allocation_breaks_ties_on_free_vram_then_id() {
        let mut pool = pool(vec![device(0, 24 * GIB, &[]), device(1, 48 * GIB, &[])]);
        assert_eq!(pool.allocate(TaskId::new(), 4 * GIB), Some(1));

        let mut pool = pool_of_equal_devices();
        assert_eq!(pool.allocate(TaskId::new(), 4 * GIB), Some(0), "id is the final tiebreak");
    }

    fn pool_of_equal_devices() -> GpuPool {
        pool(vec![device(0, 24 * GIB, &[]), device(1, 24 * GIB, &[])])
    }

    #[test]
    fn requirement_is_never_split_across_devices() {
        // device 0 has 4 GiB free, its peer has 10 GiB free; a 5 GiB task
        // must land on the peer in one piece
        let mut a = device(0, 24 * GIB, &[1]);
        a.used_vram = 20 * GIB;
        let mut b = device(1, 24 * GIB, &[0]);
        b.used_vram = 14 * GIB;
        let mut pool = pool(vec![a, b]);

        assert_eq!(pool.allocate(TaskId::new(), 5 * GIB), Some(1));
        assert_eq!(pool.device(0).unwrap().used_vram, 20 * GIB, "device 0 untouched");
    }

    #[test]
    fn unhealthy_devices_are_not_candidates() {
        let mut pool = pool_of_equal_devices();
        pool.mark_health(0, HealthState::Failed);
        pool.mark_health(1, HealthState::Degraded);
        assert_eq!(pool.allocate(TaskId::new(), GIB), None);

        pool.mark_health(1, HealthState::Healthy);
        assert_eq!(pool.allocate(TaskId::new(), GIB), Some(1));
    }

    #[test]
    fn allocate_respects_capacity() {
        let mut pool = pool(vec![device(0, 24 * GIB, &[])]);
        let first = TaskId::new();
        assert_eq!(pool.allocate(first, 20 * GIB), Some(0));
        assert_eq!(pool.allocate(TaskId::new(), 8 * GIB), None);

        pool.release(&first, 20 * GIB);
        assert_eq!(pool.allocate(TaskId::new(), 8 * GIB), Some(0));
    }

    #[test]
    fn release_without_allocation_is_a_noop() {
        let mut pool = pool_of_equal_devices();
        assert_eq!(pool.release(&TaskId::new(), GIB), None);
        assert_eq!(pool.device(0).unwrap().used_vram, 0);
    }

    #[test]
    fn release_frees_exactly_the_requested_vram() {
        let mut pool = pool(vec![device(0, 24 * GIB, &[])]);
        let a = TaskId::new();
        let b = TaskId::new();
        pool.allocate(a, 8 * GIB);
        pool.allocate(b, 8 * GIB);

        pool.release(&a, 8 * GIB);
        let device = pool.device(0).unwrap();
        assert_eq!(device.used_vram, 8 * GIB);
        assert!(device.active_tasks.contains(&b));
        assert!(!device.active_tasks.contains(&a));
    }
}
