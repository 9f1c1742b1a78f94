//! Health monitor and failover controller
//!
//! Two independent loops: a fast telemetry sampler feeding per-device
//! readings into the pool, and a slower evaluator driving health transitions.
//! Failing a device reassigns its tasks; failures never touch tasks on
//! healthy devices.

use std::sync::Arc;

use anyhow::Result;
use api_types::{GpuId, TaskId};
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::metrics::MetricsSink;
use crate::pool::HealthState;
use crate::sched::Scheduler;
use crate::telemetry::{GpuTelemetry, MemoryInfo};

struct DeviceReading {
    memory: MemoryInfo,
    utilization: u32,
    temperature: u32,
}

pub struct HealthMonitor {
    scheduler: Arc<Scheduler>,
    telemetry: Arc<dyn GpuTelemetry>,
    config: HealthConfig,
    sink: Arc<dyn MetricsSink>,
}

impl HealthMonitor {
    pub fn new(
        scheduler: Arc<Scheduler>,
        telemetry: Arc<dyn GpuTelemetry>,
        config: HealthConfig,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            scheduler,
            telemetry,
            config,
            sink,
        }
    }

    /// Fast loop: telemetry readings into the device table
    pub async fn run_sampler(&self, token: CancellationToken) {
        let interval = self.config.sample_interval();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("health sampler shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.sample_once();
                }
            }
        }
    }

    /// Slow loop: health transitions and failover
    pub async fn run_evaluator(&self, token: CancellationToken) {
        let interval = self.config.evaluate_interval();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("health evaluator shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.evaluate_once();
                }
            }
        }
    }

    fn read_device(&self, gpu: GpuId) -> Result<DeviceReading> {
        Ok(DeviceReading {
            utilization: self.telemetry.utilization(gpu)?,
            memory: self.telemetry.memory_info(gpu)?,
            temperature: self.telemetry.temperature(gpu)?,
        })
    }

    /// Sample every device once. Telemetry is queried without holding the
    /// registry lock.
    pub fn sample_once(&self) {
        let ids = self
            .scheduler
            .pool()
            .read()
            .expect("poisoned")
            .device_ids();
        for gpu in ids {
            let reading = self.read_device(gpu);
            let mut pool = self.scheduler.pool().write().expect("poisoned");
            let Some(device) = pool.device_mut(gpu) else {
                continue;
            };
            match reading {
                Ok(reading) => {
                    device.last_utilization = reading.utilization;
                    device.last_memory_used = reading.memory.used;
                    device.last_temperature = reading.temperature;
                    if reading.temperature <= self.config.temperature_hard_limit {
                        device.healthy_samples = device.healthy_samples.saturating_add(1);
                        // the error counter rolls off as good samples arrive
                        device.error_count = device.error_count.saturating_sub(1);
                    } else {
                        device.healthy_samples = 0;
                    }
                }
                Err(e) => {
                    device.error_count += 1;
                    device.healthy_samples = 0;
                    tracing::warn!(gpu, "telemetry sample failed: {e:#}");
                }
            }
        }
    }

    /// Evaluate health transitions once and fail over tasks of newly failed
    /// devices.
    pub fn evaluate_once(&self) {
        let mut newly_failed: Vec<(GpuId, Vec<TaskId>)> = Vec::new();
        {
            let mut pool = self.scheduler.pool().write().expect("poisoned");
            let transitions: Vec<(GpuId, HealthState, HealthState)> = pool
                .devices()
                .map(|d| (d.id, d.health, self.desired_state(d)))
                .collect();

            for (gpu, current, desired) in transitions {
                if current == desired {
                    continue;
                }
                pool.mark_health(gpu, desired);
                let Some(device) = pool.device_mut(gpu) else {
                    continue;
                };
                match desired {
                    HealthState::Failed => {
                        device.healthy_samples = 0;
                        newly_failed.push((gpu, device.active_tasks.iter().copied().collect()));
                        tracing::error!(
                            gpu,
                            temperature = device.last_temperature,
                            errors = device.error_count,
                            "device failed, excluding from allocation"
                        );
                    }
                    HealthState::Healthy if current == HealthState::Failed => {
                        device.error_count = 0;
                        tracing::info!(gpu, "device recovered");
                    }
                    _ => {}
                }
            }
        }

        for (gpu, tasks) in newly_failed {
            self.sink.counter("device_failures", &[], 1);
            for id in tasks {
                self.scheduler.reassign_from_failed(id, gpu);
            }
        }
    }

    fn desired_state(&self, device: &crate::pool::GpuDevice) -> HealthState {
        match device.health {
            HealthState::Healthy | HealthState::Degraded => {
                if device.last_temperature > self.config.temperature_hard_limit
                    || device.error_count > self.config.error_threshold
                {
                    HealthState::Failed
                } else if device.last_temperature > self.config.temperature_soft_limit {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                }
            }
            HealthState::Failed => {
                let cooled_down = device
                    .failed_at
                    .map(|at| at.elapsed() >= self.config.recovery_cooldown())
                    .unwrap_or(true);
                if cooled_down && device.healthy_samples >= self.config.recovery_samples {
                    HealthState::Healthy
                } else {
                    HealthState::Failed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::{CollectingSink, MockBackend, MockTelemetry};
    use crate::pool::{GpuDevice, GpuPool};
    use crate::sched::Scheduler;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn monitor(config: HealthConfig) -> (HealthMonitor, Arc<Scheduler>, Arc<MockTelemetry>) {
        let telemetry = Arc::new(MockTelemetry::new());
        telemetry.add_device(0, 24 * GIB, &[1]);
        telemetry.add_device(1, 24 * GIB, &[0]);
        let pool = GpuPool::from_telemetry(telemetry.as_ref()).unwrap();
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            pool,
            Arc::new(MockBackend::new()),
            Arc::new(CollectingSink::new()),
        );
        let monitor = HealthMonitor::new(
            scheduler.clone(),
            telemetry.clone(),
            config,
            Arc::new(CollectingSink::new()),
        );
        (monitor, scheduler, telemetry)
    }

    #[test(tokio::test)]
    async fn sampler_records_device_readings() {
        let (monitor, scheduler, telemetry) = monitor(HealthConfig::default());
        telemetry.set_temperature(0, 70);
        telemetry.set_utilization(0, 55);
        monitor.sample_once();

        let devices = scheduler.device_snapshot();
        assert_eq!(devices[0].last_temperature, 70);
        assert_eq!(devices[0].last_utilization, 55);
        assert!(devices[0].healthy_samples >= 1);
    }

    #[test(tokio::test)]
    async fn telemetry_errors_accumulate_on_the_device() {
        let (monitor, scheduler, telemetry) = monitor(HealthConfig::default());
        telemetry.set_error_mode(0, true);
        monitor.sample_once();
        monitor.sample_once();

        let devices = scheduler.device_snapshot();
        assert_eq!(devices[0].error_count, 2);
        assert_eq!(devices[0].healthy_samples, 0);
        assert_eq!(devices[1].error_count, 0, "healthy peer is untouched");
    }

    #[test(tokio::test)]
    async fn overheating_marks_the_device_degraded_then_failed() {
        let (monitor, scheduler, telemetry) = monitor(HealthConfig::default());
        telemetry.set_temperature(0, 88);
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(scheduler.device_snapshot()[0].health, HealthState::Degraded);

        telemetry.set_temperature(0, 99);
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(scheduler.device_snapshot()[0].health, HealthState::Failed);
    }

    #[test(tokio::test)]
    async fn degraded_device_returns_to_healthy_when_it_cools() {
        let (monitor, scheduler, telemetry) = monitor(HealthConfig::default());
        telemetry.set_temperature(1, 90);
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(scheduler.device_snapshot()[1].health, HealthState::Degraded);

        telemetry.set_temperature(1, 60);
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(scheduler.device_snapshot()[1].health, HealthState::Healthy);
    }

    #[test(tokio::test)]
    async fn failed_device_recovers_after_cooldown_and_clean_samples() {
        let config = HealthConfig {
            recovery_samples: 3,
            recovery_cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (monitor, scheduler, telemetry) = monitor(config);
        telemetry.set_temperature(0, 99);
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(scheduler.device_snapshot()[0].health, HealthState::Failed);

        telemetry.set_temperature(0, 60);
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(
            scheduler.device_snapshot()[0].health,
            HealthState::Failed,
            "one clean sample is not enough"
        );

        monitor.sample_once();
        monitor.sample_once();
        monitor.evaluate_once();
        assert_eq!(scheduler.device_snapshot()[0].health, HealthState::Healthy);
        assert_eq!(scheduler.device_snapshot()[0].error_count, 0);
    }
}
