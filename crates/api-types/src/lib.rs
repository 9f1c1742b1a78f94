//! Shared API type definitions
//!
//! This crate contains the types exchanged between upstream request handlers
//! and the GPU task scheduler: task identifiers, priority levels, task status
//! and the submit / status / cancel request-response shapes.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Opaque task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// GPU device index within the local pool
pub type GpuId = u32;

/// Priority levels, highest urgency first. The numeric value is the wire
/// representation; lower numbers are served earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Interactive generation, served before everything else
    Realtime = 0,
    /// Latency-sensitive background work
    High = 1,
    /// Default level
    Normal = 2,
    /// Bulk/offline work, never preempts
    Batch = 3,
}

/// Highest numeric priority value (lowest urgency)
pub const MAX_PRIORITY: u8 = Priority::Batch as u8;

impl Priority {
    /// All levels in service order
    pub const LEVELS: [Priority; 4] = [
        Priority::Realtime,
        Priority::High,
        Priority::Normal,
        Priority::Batch,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Realtime => "realtime",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Batch => "batch",
        };
        write!(f, "{name}")
    }
}

/// Error for out-of-range priority values on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPriority(pub u8);

impl std::fmt::Display for InvalidPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid priority level: {}", self.0)
    }
}

impl std::error::Error for InvalidPriority {}

impl TryFrom<u8> for Priority {
    type Error = InvalidPriority;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Realtime),
            1 => Ok(Priority::High),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::Batch),
            other => Err(InvalidPriority(other)),
        }
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting in its priority queue
    Queued,
    /// Allocated to a device and handed to the execution backend
    Running,
    /// Execution backend reported success
    Completed,
    /// Terminal failure, see the attached error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Task submission payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Workload category, e.g. "image", "speech", "video"
    pub kind: String,
    /// Priority level
    pub priority: Priority,
    /// GPU memory requirement in bytes
    pub vram_required: u64,
    /// Caller's duration estimate in seconds, if known
    pub estimated_duration_secs: Option<u64>,
    /// Caller-supplied execution timeout in seconds; the configured default
    /// applies when absent
    pub execution_timeout_secs: Option<u64>,
}

/// Response format for task submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Whether the task was admitted
    pub success: bool,
    /// Identifier of the admitted task (present when successful)
    pub task_id: Option<TaskId>,
    /// Response message
    pub message: String,
}

/// Point-in-time view of a task, returned by the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Device the task is running on, if any
    pub gpu_id: Option<GpuId>,
    /// Seconds spent between submission and allocation (still growing while
    /// the task is queued)
    pub wait_time_secs: f64,
    /// Terminal error description, if the task failed
    pub error: Option<String>,
    /// Whether a failed task is safe to resubmit
    pub retriable: bool,
}

/// Response format for the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the task was found
    pub success: bool,
    /// Task view data (present when successful)
    pub data: Option<TaskView>,
    /// Response message
    pub message: String,
}
