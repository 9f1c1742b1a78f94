//! Metrics sink and exporter
//!
//! Event-time counters and histogram observations come straight from the
//! scheduling paths; device and queue gauges are published by a periodic
//! exporter loop. The production sink renders InfluxDB line protocol into a
//! rolling file.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use influxdb_line_protocol::LineProtocolBuilder;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::pool::HealthState;
use crate::sched::Scheduler;

/// Field payload of a single metrics point
#[derive(Debug, Clone, Copy)]
pub enum FieldValue {
    Float(f64),
    Unsigned(u64),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::Unsigned(value)
    }
}

/// Metrics sink interface
pub trait MetricsSink: Send + Sync {
    /// Point-in-time value
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Monotonic increment
    fn counter(&self, name: &str, labels: &[(&str, &str)], delta: u64);

    /// Single observation of a distribution
    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards everything; used when metrics are disabled
pub struct NullSink;

impl MetricsSink for NullSink {
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn counter(&self, _name: &str, _labels: &[(&str, &str)], _delta: u64) {}
    fn histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

fn encode_line(
    measurement: &str,
    labels: &[(&str, &str)],
    field: &str,
    value: FieldValue,
    timestamp: i64,
) -> Vec<u8> {
    let mut builder = LineProtocolBuilder::new().measurement(measurement);
    for (key, tag) in labels {
        builder = builder.tag(key, tag);
    }
    let built = match value {
        FieldValue::Float(v) => builder.field(field, v),
        FieldValue::Unsigned(v) => builder.field(field, v),
    };
    built.timestamp(timestamp).close_line().build()
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// InfluxDB line protocol sink writing to a daily-rotated file
pub struct InfluxFileSink {
    writer: NonBlocking,
}

impl InfluxFileSink {
    /// Build the sink and its flush guard; keep the guard alive for the
    /// process lifetime
    pub fn create<P: AsRef<Path>>(metrics_file: P) -> Result<(Arc<Self>, WorkerGuard)> {
        let metrics_file = metrics_file.as_ref();
        let dir = metrics_file.parent().context("metrics file directory")?;
        let file = metrics_file.file_name().context("metrics file name")?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(file.to_string_lossy())
            .max_log_files(3)
            .build(dir)
            .context("create rolling metrics appender")?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok((Arc::new(Self { writer }), guard))
    }

    fn write_line(&self, measurement: &str, labels: &[(&str, &str)], field: &str, value: FieldValue) {
        let line = encode_line(measurement, labels, field, value, now_nanos());
        let mut writer = self.writer.clone();
        if let Err(e) = writer.write_all(&line) {
            tracing::warn!("failed to write metrics line: {e}");
        }
    }
}

impl MetricsSink for InfluxFileSink {
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.write_line(name, labels, "value", value.into());
    }

    fn counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        self.write_line(name, labels, "delta", delta.into());
    }

    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.write_line(name, labels, "value", value.into());
    }
}

fn health_gauge(state: HealthState) -> f64 {
    match state {
        HealthState::Healthy => 0.0,
        HealthState::Degraded => 1.0,
        HealthState::Failed => 2.0,
    }
}

/// Periodic gauge publisher for device and queue state
pub struct MetricsExporter {
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn MetricsSink>,
    interval: std::time::Duration,
}

impl MetricsExporter {
    pub fn new(
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn MetricsSink>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            scheduler,
            sink,
            interval,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("metrics exporter shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.export_once();
                }
            }
        }
    }

    pub fn export_once(&self) {
        for device in self.scheduler.device_snapshot() {
            let gpu = device.id.to_string();
            let labels = [("gpu", gpu.as_str())];
            self.sink
                .gauge("gpu_utilization", &labels, device.last_utilization as f64);
            self.sink
                .gauge("gpu_memory_used_bytes", &labels, device.last_memory_used as f64);
            self.sink
                .gauge("gpu_memory_total_bytes", &labels, device.total_vram as f64);
            self.sink
                .gauge("gpu_temperature_celsius", &labels, device.last_temperature as f64);
            self.sink
                .gauge("gpu_active_tasks", &labels, device.active_tasks.len() as f64);
            self.sink
                .gauge("gpu_health", &labels, health_gauge(device.health));
        }

        for stats in self.scheduler.queue_stats() {
            let priority = stats.priority.to_string();
            let labels = [("priority", priority.as_str())];
            self.sink
                .gauge("queue_depth", &labels, stats.depth as f64);
            self.sink.gauge(
                "queue_oldest_wait_seconds",
                &labels,
                stats.oldest_wait.map(|d| d.as_secs_f64()).unwrap_or(0.0),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_line_renders_tags_and_fields() {
        let line = encode_line(
            "gpu_utilization",
            &[("gpu", "0")],
            "value",
            FieldValue::Float(42.5),
            1609459200000000000,
        );
        let line = String::from_utf8(line).unwrap();
        assert!(line.starts_with("gpu_utilization,gpu=0 "));
        assert!(line.contains("value=42.5"));
        assert!(line.contains("1609459200000000000"));
    }

    #[test]
    fn encode_line_renders_unsigned_fields() {
        let line = encode_line(
            "preemptions",
            &[("outcome", "success")],
            "delta",
            FieldValue::Unsigned(1),
            1,
        );
        let line = String::from_utf8(line).unwrap();
        assert!(line.contains("outcome=success"));
        assert!(line.contains("delta=1u"));
    }

    #[test]
    fn influx_sink_writes_into_the_rolling_file_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.log");
        let (sink, guard) = InfluxFileSink::create(&path).unwrap();
        sink.gauge("queue_depth", &[("priority", "batch")], 3.0);
        drop(guard); // flush
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(!entries.is_empty(), "rotated metrics file exists");
    }
}
