//! Daemon CLI arguments and scheduler configuration

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use api_types::Priority;
use clap::Parser;
use serde::Deserialize;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Parser, Clone, Debug)]
#[command(name = "gpu-scheduler", about = "GPU task scheduler daemon")]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "SCHEDULER_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the scheduler YAML configuration, e.g. /etc/gpu-scheduler/config.yaml"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "GPU_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "logs/metrics.log",
        help = "Path for GPU and queue metrics in InfluxDB line protocol"
    )]
    pub metrics_file: PathBuf,

    #[arg(
        long,
        help = "Enable metrics collection",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_metrics: bool,

    #[arg(
        long,
        env = "SIMULATED_TASK_SECS",
        default_value = "30",
        help = "Default duration of the simulated execution backend, in seconds"
    )]
    pub simulated_task_secs: u64,

    #[arg(
        long,
        help = "Scheduler configuration as a JSON string (takes precedence over --config)",
        env = "SCHEDULER_CONFIG_JSON",
        value_parser = parse_config_json
    )]
    pub config_json: Option<SchedulerConfig>,
}

/// Parse a JSON string into a scheduler configuration
fn parse_config_json(s: &str) -> Result<SchedulerConfig, String> {
    serde_json::from_str(s).map_err(|e| format!("Failed to parse scheduler config JSON: {e}"))
}

/// Starvation handling for queues shadowed by continuous higher-priority
/// traffic. Only `None` is implemented; the knob exists so operators choose a
/// policy explicitly once one lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StarvationPolicy {
    #[default]
    None,
}

/// Health monitor thresholds and intervals
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Fast telemetry sampling interval in seconds
    pub sample_interval_secs: u64,
    /// Slow health evaluation interval in seconds
    pub evaluate_interval_secs: u64,
    /// Above this temperature the device is Degraded (no new allocations)
    pub temperature_soft_limit: u32,
    /// Above this temperature the device is Failed (tasks reassigned)
    pub temperature_hard_limit: u32,
    /// Telemetry errors tolerated before the device is Failed
    pub error_threshold: u32,
    /// Consecutive in-limits samples required for Failed -> Healthy
    pub recovery_samples: u32,
    /// Minimum time a device stays Failed before recovery is considered
    pub recovery_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 1,
            evaluate_interval_secs: 60,
            temperature_soft_limit: 85,
            temperature_hard_limit: 95,
            error_threshold: 5,
            recovery_samples: 30,
            recovery_cooldown_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_secs(self.evaluate_interval_secs)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }
}

/// Scheduling parameters, loadable from YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Bounded capacity of each priority queue
    pub queue_capacity: usize,
    /// Concurrent queue workers per priority level
    pub workers_per_queue: usize,
    /// How long `submit` may block waiting for a queue slot
    pub admission_timeout_secs: u64,
    /// Delay before an unallocatable task returns to its queue tail
    pub allocation_backoff_ms: u64,
    /// Only priorities at or above this level may preempt
    pub preempt_threshold: Priority,
    /// VRAM normalization constant in the preemption score
    pub reference_vram: u64,
    /// Per-kind VRAM admission ceilings in bytes
    pub vram_ceilings: HashMap<String, u64>,
    /// Ceiling for kinds without an explicit entry
    pub default_vram_ceiling: u64,
    /// Execution timeout for tasks that do not supply one
    pub default_execution_timeout_secs: u64,
    /// Metrics export interval in seconds
    pub metrics_interval_secs: u64,
    pub starvation_policy: StarvationPolicy,
    pub health: HealthConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            workers_per_queue: 2,
            admission_timeout_secs: 5,
            allocation_backoff_ms: 200,
            preempt_threshold: Priority::High,
            reference_vram: 24 * GIB,
            vram_ceilings: HashMap::new(),
            default_vram_ceiling: 48 * GIB,
            default_execution_timeout_secs: 3600,
            metrics_interval_secs: 5,
            starvation_policy: StarvationPolicy::None,
            health: HealthConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load from YAML, falling back to defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read scheduler config {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parse scheduler config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    pub fn allocation_backoff(&self) -> Duration {
        Duration::from_millis(self.allocation_backoff_ms)
    }

    pub fn default_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.default_execution_timeout_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Whether this priority level may evict lower-priority work
    pub fn can_preempt(&self, priority: Priority) -> bool {
        priority <= self.preempt_threshold
    }

    /// Admission ceiling for a workload kind
    pub fn vram_ceiling(&self, kind: &str) -> u64 {
        self.vram_ceilings
            .get(kind)
            .copied()
            .unwrap_or(self.default_vram_ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SchedulerConfig::default();
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.admission_timeout(), Duration::from_secs(5));
        assert_eq!(config.preempt_threshold, Priority::High);
        assert_eq!(config.health.temperature_hard_limit, 95);
    }

    #[test]
    fn batch_never_preempts_with_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.can_preempt(Priority::Realtime));
        assert!(config.can_preempt(Priority::High));
        assert!(!config.can_preempt(Priority::Normal));
        assert!(!config.can_preempt(Priority::Batch));
    }

    #[test]
    fn deserialize_partial_yaml_keeps_defaults() {
        let yaml = r#"
queueCapacity: 16
preemptThreshold: realtime
vramCeilings:
  video: 42949672960
health:
  temperatureHardLimit: 90
"#;
        let config: SchedulerConfig = serde_yaml::from_str(yaml).expect("partial yaml parses");
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.preempt_threshold, Priority::Realtime);
        assert_eq!(config.vram_ceiling("video"), 40 * GIB);
        assert_eq!(config.health.temperature_hard_limit, 90);
        // untouched fields keep their defaults
        assert_eq!(config.workers_per_queue, 2);
        assert_eq!(config.health.evaluate_interval_secs, 60);
    }

    #[test]
    fn parse_config_json_from_string() {
        let json = r#"{"queueCapacity": 32, "preemptThreshold": "realtime"}"#;
        let config = parse_config_json(json).expect("should parse scheduler config from string");
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.preempt_threshold, Priority::Realtime);
        assert_eq!(config.admission_timeout_secs, 5, "missing fields use defaults");
    }

    #[test]
    fn parse_config_json_rejects_garbage() {
        assert!(parse_config_json("not json").is_err());
    }

    #[test]
    fn vram_ceiling_falls_back_to_the_default() {
        let mut config = SchedulerConfig::default();
        config.vram_ceilings.insert("video".to_string(), 40 * GIB);
        assert_eq!(config.vram_ceiling("video"), 40 * GIB);
        assert_eq!(config.vram_ceiling("speech"), config.default_vram_ceiling);
    }
}
