//! Test adapters for the external seams
//!
//! Mock implementations of the telemetry, execution backend and metrics sink
//! traits, used by unit and integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use api_types::{GpuId, TaskId};
use tokio::sync::oneshot;

use crate::backend::{CompletionHandle, ExecutionBackend, ExecutionOutcome, TaskSpec};
use crate::metrics::MetricsSink;
use crate::telemetry::{GpuTelemetry, MemoryInfo};

#[derive(Debug, Clone)]
struct MockDevice {
    total_vram: u64,
    used_vram: u64,
    utilization: u32,
    temperature: u32,
    peers: Vec<GpuId>,
    error_mode: bool,
}

/// In-memory telemetry with controllable readings per device
#[derive(Default)]
pub struct MockTelemetry {
    devices: Mutex<HashMap<GpuId, MockDevice>>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, gpu: GpuId, total_vram: u64, peers: &[GpuId]) {
        self.devices.lock().unwrap().insert(
            gpu,
            MockDevice {
                total_vram,
                used_vram: 0,
                utilization: 0,
                temperature: 40,
                peers: peers.to_vec(),
                error_mode: false,
            },
        );
    }

    pub fn set_temperature(&self, gpu: GpuId, celsius: u32) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(&gpu) {
            device.temperature = celsius;
        }
    }

    pub fn set_utilization(&self, gpu: GpuId, pct: u32) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(&gpu) {
            device.utilization = pct;
        }
    }

    pub fn set_used_vram(&self, gpu: GpuId, bytes: u64) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(&gpu) {
            device.used_vram = bytes;
        }
    }

    /// Make every query for this device fail, for error-path testing
    pub fn set_error_mode(&self, gpu: GpuId, enabled: bool) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(&gpu) {
            device.error_mode = enabled;
        }
    }

    fn with_device<T>(&self, gpu: GpuId, f: impl FnOnce(&MockDevice) -> T) -> Result<T> {
        let devices = self.devices.lock().unwrap();
        let device = devices
            .get(&gpu)
            .ok_or_else(|| anyhow!("unknown device {gpu}"))?;
        if device.error_mode {
            return Err(anyhow!("injected telemetry error for device {gpu}"));
        }
        Ok(f(device))
    }
}

impl GpuTelemetry for MockTelemetry {
    fn device_count(&self) -> Result<u32> {
        Ok(self.devices.lock().unwrap().len() as u32)
    }

    fn memory_info(&self, gpu: GpuId) -> Result<MemoryInfo> {
        self.with_device(gpu, |d| MemoryInfo {
            total: d.total_vram,
            used: d.used_vram,
        })
    }

    fn utilization(&self, gpu: GpuId) -> Result<u32> {
        self.with_device(gpu, |d| d.utilization)
    }

    fn temperature(&self, gpu: GpuId) -> Result<u32> {
        self.with_device(gpu, |d| d.temperature)
    }

    fn topology_peers(&self, gpu: GpuId) -> Result<Vec<GpuId>> {
        self.with_device(gpu, |d| d.peers.clone())
    }
}

/// Execution backend with externally driven completions
#[derive(Default)]
pub struct MockBackend {
    started: Mutex<Vec<TaskId>>,
    pending: Mutex<HashMap<TaskId, oneshot::Sender<ExecutionOutcome>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks handed to the backend so far, in order
    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().unwrap().clone()
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.lock().unwrap().contains_key(&id)
    }

    /// Resolve a pending task. Returns false when the task is unknown or the
    /// scheduler stopped listening (cancelled / preempted).
    pub fn complete(&self, id: TaskId, outcome: ExecutionOutcome) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for MockBackend {
    async fn execute(&self, spec: TaskSpec) -> Result<CompletionHandle> {
        let (tx, handle) = CompletionHandle::channel();
        self.started.lock().unwrap().push(spec.id);
        self.pending.lock().unwrap().insert(spec.id, tx);
        Ok(handle)
    }
}

/// Recorded metrics event
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Gauge { name: String, value: f64 },
    Counter { name: String, labels: Vec<(String, String)>, delta: u64 },
    Histogram { name: String, value: f64 },
}

/// Sink that captures every emission for assertions
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Sum of counter deltas matching name and labels
    pub fn counter_total(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                MetricEvent::Counter {
                    name: n,
                    labels: l,
                    delta,
                } if n == name
                    && labels.iter().all(|(k, v)| {
                        l.iter().any(|(lk, lv)| lk == k && lv == v)
                    }) =>
                {
                    Some(*delta)
                }
                _ => None,
            })
            .sum()
    }
}

impl MetricsSink for CollectingSink {
    fn gauge(&self, name: &str, _labels: &[(&str, &str)], value: f64) {
        self.events.lock().unwrap().push(MetricEvent::Gauge {
            name: name.to_string(),
            value,
        });
    }

    fn counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        self.events.lock().unwrap().push(MetricEvent::Counter {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            delta,
        });
    }

    fn histogram(&self, name: &str, _labels: &[(&str, &str)], value: f64) {
        self.events.lock().unwrap().push(MetricEvent::Histogram {
            name: name.to_string(),
            value,
        });
    }
}
