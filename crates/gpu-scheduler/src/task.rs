//! Task records and the task table
//!
//! The task table is the single owner of every task record from submission
//! until the record is dropped; devices and queues refer to tasks by id only.

use std::collections::HashMap;
use std::time::Duration;

use api_types::{GpuId, Priority, SubmitRequest, TaskId, TaskStatus, TaskView};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// A single scheduled workload
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Workload category, e.g. "image", "speech", "video"
    pub kind: String,
    pub priority: Priority,
    /// GPU memory requirement in bytes
    pub vram_required: u64,
    pub created_at: DateTime<Utc>,
    /// Set on every transition into Running, cleared when the task leaves it
    pub started_at: Option<DateTime<Utc>>,
    /// Device the task is allocated to; `Some` iff status is Running
    pub gpu_id: Option<GpuId>,
    pub estimated_duration: Option<Duration>,
    /// Caller-supplied execution timeout; the configured default applies
    /// when absent
    pub execution_timeout: Option<Duration>,
    pub status: TaskStatus,
    pub error: Option<String>,
    /// Whether a failed task is safe to resubmit
    pub retriable: bool,
    /// Cancels the execution watcher of the current run; present iff Running
    pub run_token: Option<CancellationToken>,
}

impl Task {
    pub fn new(req: &SubmitRequest) -> Self {
        Self {
            id: TaskId::new(),
            kind: req.kind.clone(),
            priority: req.priority,
            vram_required: req.vram_required,
            created_at: Utc::now(),
            started_at: None,
            gpu_id: None,
            estimated_duration: req.estimated_duration_secs.map(Duration::from_secs),
            execution_timeout: req.execution_timeout_secs.map(Duration::from_secs),
            status: TaskStatus::Queued,
            error: None,
            retriable: false,
            run_token: None,
        }
    }

    /// Transition Queued -> Running on the given device
    pub fn mark_running(&mut self, gpu: GpuId, run_token: CancellationToken) {
        self.status = TaskStatus::Running;
        self.gpu_id = Some(gpu);
        self.started_at = Some(Utc::now());
        self.run_token = Some(run_token);
    }

    /// Transition Running -> Queued (preemption or failover reassignment)
    pub fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.gpu_id = None;
        self.started_at = None;
        self.run_token = None;
    }

    /// Move into a terminal state, dropping any run bookkeeping
    pub fn mark_terminal(&mut self, status: TaskStatus, error: Option<String>, retriable: bool) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.retriable = retriable;
        self.gpu_id = None;
        self.run_token = None;
    }

    /// Seconds the current run has been executing; zero when not running
    pub fn runtime_secs(&self) -> f64 {
        self.started_at
            .map(|started| (Utc::now() - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    /// Seconds between submission and allocation, still growing while queued
    pub fn wait_time_secs(&self) -> f64 {
        let until = self.started_at.unwrap_or_else(Utc::now);
        (until - self.created_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            status: self.status,
            gpu_id: self.gpu_id,
            wait_time_secs: self.wait_time_secs(),
            error: self.error.clone(),
            retriable: self.retriable,
        }
    }
}

/// All task records, keyed by id
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
}

impl TaskTable {
    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        self.tasks.remove(id)
    }

    /// All Running tasks, the preemption planner's candidate universe
    pub fn running(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest {
            kind: "image".to_string(),
            priority: Priority::Normal,
            vram_required: 1024,
            estimated_duration_secs: Some(30),
            execution_timeout_secs: None,
        }
    }

    #[test]
    fn new_task_is_queued_without_allocation() {
        let task = Task::new(&request());
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.gpu_id.is_none());
        assert!(task.started_at.is_none());
        assert_eq!(task.estimated_duration, Some(Duration::from_secs(30)));
    }

    #[test]
    fn running_state_carries_allocation() {
        let mut task = Task::new(&request());
        task.mark_running(1, CancellationToken::new());
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.gpu_id, Some(1));
        assert!(task.started_at.is_some());

        task.mark_queued();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.gpu_id.is_none(), "gpu_id is set iff the task is running");
        assert!(task.run_token.is_none());
    }

    #[test]
    fn terminal_transition_clears_run_state() {
        let mut task = Task::new(&request());
        task.mark_running(0, CancellationToken::new());
        task.mark_terminal(TaskStatus::Failed, Some("device 0 was marked failed".into()), true);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.gpu_id.is_none());
        assert!(task.retriable);
    }

    #[test]
    fn running_iterator_skips_queued_tasks() {
        let mut table = TaskTable::default();
        let queued = Task::new(&request());
        let mut running = Task::new(&request());
        running.mark_running(0, CancellationToken::new());
        let running_id = running.id;
        table.insert(queued);
        table.insert(running);

        let ids: Vec<TaskId> = table.running().map(|t| t.id).collect();
        assert_eq!(ids, vec![running_id]);
    }
}
