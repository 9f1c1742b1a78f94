use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use gpu_scheduler::app::Tasks;
use gpu_scheduler::backend::SimulatedBackend;
use gpu_scheduler::config::{DaemonArgs, SchedulerConfig};
use gpu_scheduler::health::HealthMonitor;
use gpu_scheduler::logging;
use gpu_scheduler::metrics::{InfluxFileSink, MetricsExporter, MetricsSink, NullSink};
use gpu_scheduler::pool::GpuPool;
use gpu_scheduler::telemetry::{GpuTelemetry, NvmlTelemetry};
use gpu_scheduler::Scheduler;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();
    logging::init();

    let args = DaemonArgs::parse();
    let config = match args.config_json.clone() {
        Some(config) => config,
        None => SchedulerConfig::load(args.config.as_deref())?,
    };

    tracing::info!("Starting GPU scheduler daemon");

    let telemetry: Arc<dyn GpuTelemetry> =
        Arc::new(NvmlTelemetry::init().context("initialize GPU telemetry")?);
    let pool = GpuPool::from_telemetry(telemetry.as_ref()).context("enumerate GPU pool")?;
    if pool.is_empty() {
        anyhow::bail!("no GPUs found, refusing to start");
    }

    // keep the guard alive for the process lifetime so metrics flush on exit
    let (sink, _metrics_guard): (Arc<dyn MetricsSink>, _) = if args.enable_metrics {
        let (sink, guard) =
            InfluxFileSink::create(&args.metrics_file).context("create metrics sink")?;
        (sink, Some(guard))
    } else {
        (Arc::new(NullSink), None)
    };

    let backend = Arc::new(SimulatedBackend::new(Duration::from_secs(
        args.simulated_task_secs,
    )));

    let scheduler = Scheduler::new(config.clone(), pool, backend, sink.clone());
    let health = HealthMonitor::new(
        scheduler.clone(),
        telemetry,
        config.health.clone(),
        sink.clone(),
    );
    let exporter = args.enable_metrics.then(|| {
        MetricsExporter::new(scheduler.clone(), sink.clone(), config.metrics_interval())
    });

    let mut tasks = Tasks::new();
    tasks.spawn_all(&scheduler, health, exporter);
    tasks.wait_for_completion().await
}
