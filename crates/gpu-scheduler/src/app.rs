//! Background task management
//!
//! Spawns the long-running loops (queue workers, health monitor, metrics
//! exporter) and coordinates graceful shutdown on signals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::HealthMonitor;
use crate::metrics::MetricsExporter;
use crate::sched::Scheduler;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Start all background tasks
    pub fn spawn_all(
        &mut self,
        scheduler: &Arc<Scheduler>,
        health: HealthMonitor,
        exporter: Option<MetricsExporter>,
    ) {
        // queue workers, one set per priority level
        self.tasks
            .extend(scheduler.spawn_workers(&self.cancellation_token));

        // health monitor: fast sampler and slow evaluator
        let health = Arc::new(health);
        let sampler_task = {
            let health = health.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting health sampler task");
                health.run_sampler(token).await;
            })
        };
        self.tasks.push(sampler_task);

        let evaluator_task = {
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting health evaluator task");
                health.run_evaluator(token).await;
            })
        };
        self.tasks.push(evaluator_task);

        // metrics exporter
        if let Some(exporter) = exporter {
            let token = self.cancellation_token.clone();
            let exporter_task = tokio::spawn(async move {
                tracing::info!("Starting metrics exporter task");
                exporter.run(token).await;
            });
            self.tasks.push(exporter_task);
        }
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    tokio::signal::ctrl_c()
                        .await
                        .expect("Failed to install Ctrl+C handler");
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, _remaining) = result;
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                }
                // drop the finished handle so it is not awaited again below
                self.tasks.remove(index);
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(10)).await;
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        let tasks = std::mem::take(&mut self.tasks);
        let shutdown = async {
            for task in tasks {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        tracing::warn!("Background task ended abnormally: {e}");
                    }
                }
            }
        };
        if tokio::time::timeout(timeout, shutdown).await.is_err() {
            tracing::warn!("Timed out waiting for background tasks to stop");
        }
    }
}
