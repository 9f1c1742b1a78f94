use api_types::{GpuId, Priority, TaskId};
use thiserror::Error;

/// Unified error type for scheduler operations
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// Admission backpressure: the priority queue stayed full for the whole
    /// admission timeout
    #[error("queue for priority {priority} is full")]
    QueueFull { priority: Priority },

    #[error("insufficient GPU resources for {required} bytes of VRAM")]
    InsufficientResource { required: u64 },

    #[error("preemption failed: {reason}")]
    PreemptionError { reason: String },

    #[error("device {gpu} was marked failed")]
    DeviceFailed { gpu: GpuId },

    #[error("execution exceeded the {seconds}s timeout")]
    ExecutionTimeout { seconds: u64 },

    #[error("task not found: {id}")]
    TaskNotFound { id: TaskId },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
