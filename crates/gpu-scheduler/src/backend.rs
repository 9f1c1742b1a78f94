//! Execution backend interface
//!
//! The ML inference engines are opaque to the scheduler: a task is handed
//! over for execution and a completion handle eventually resolves. The
//! scheduler tracks occupancy only, never output correctness.

use std::time::Duration;

use anyhow::Result;
use api_types::{GpuId, Priority, TaskId};
use tokio::sync::oneshot;

/// What the backend needs to know about a task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub kind: String,
    pub priority: Priority,
    pub vram_required: u64,
    /// Device the task was allocated to
    pub gpu_id: GpuId,
    pub estimated_duration: Option<Duration>,
}

/// Terminal result reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure { reason: String },
}

/// Resolves once the backend finishes the task. A dropped sender counts as a
/// failure so the scheduler never waits forever on a vanished backend.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<ExecutionOutcome>,
}

impl CompletionHandle {
    pub fn channel() -> (oneshot::Sender<ExecutionOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub async fn wait(self) -> ExecutionOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome::Failure {
                reason: "execution backend dropped the completion channel".to_string(),
            },
        }
    }
}

/// The external inference engine seam
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, spec: TaskSpec) -> Result<CompletionHandle>;
}

/// Stand-in backend for local runs of the daemon: resolves the completion
/// handle after the caller's duration estimate. Real inference engines plug
/// in behind the same trait.
pub struct SimulatedBackend {
    default_duration: Duration,
}

impl SimulatedBackend {
    pub fn new(default_duration: Duration) -> Self {
        Self { default_duration }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn execute(&self, spec: TaskSpec) -> Result<CompletionHandle> {
        let (tx, handle) = CompletionHandle::channel();
        let duration = spec.estimated_duration.unwrap_or(self.default_duration);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // receiver may be gone if the task was cancelled mid-flight
            let _ = tx.send(ExecutionOutcome::Success);
        });
        Ok(handle)
    }
}
