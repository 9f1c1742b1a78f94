//! The scheduler
//!
//! One object owns the task table, the priority queues and the GPU pool, and
//! drives every transition between them: admission, worker dispatch,
//! preemption, execution tracking and failover reassignment.
//!
//! Lock order is task table before pool; neither lock is held across an
//! await point.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use api_types::{GpuId, Priority, SubmitRequest, TaskId, TaskStatus, TaskView};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionBackend, ExecutionOutcome, TaskSpec};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::metrics::MetricsSink;
use crate::pool::{GpuDevice, GpuPool};
use crate::preempt::{self, PreemptionCandidate, PreemptionPlan};
use crate::queue::QueueSet;
use crate::task::{Task, TaskTable};

/// Per-queue statistics for the metrics exporter
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub priority: Priority,
    pub depth: usize,
    pub oldest_wait: Option<Duration>,
}

enum DispatchOutcome {
    /// Allocated and handed to the execution backend
    Started,
    /// No device fits and no viable preemption plan; stays queued
    NoCapacity,
    /// The record reached a terminal state (or was cancelled while queued)
    Terminal,
}

pub struct Scheduler {
    config: SchedulerConfig,
    tasks: RwLock<TaskTable>,
    pool: RwLock<GpuPool>,
    queues: QueueSet,
    backend: Arc<dyn ExecutionBackend>,
    sink: Arc<dyn MetricsSink>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: GpuPool,
        backend: Arc<dyn ExecutionBackend>,
        sink: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: QueueSet::new(config.queue_capacity),
            config,
            tasks: RwLock::new(TaskTable::default()),
            pool: RwLock::new(pool),
            backend,
            sink,
        })
    }

    /// Admit a task into its priority queue. Blocks up to the admission
    /// timeout when the queue is full, then fails with `QueueFull`.
    pub async fn submit(&self, req: SubmitRequest) -> Result<TaskId> {
        let ceiling = self.config.vram_ceiling(&req.kind);
        if req.vram_required == 0 {
            return Err(SchedulerError::InvalidRequest {
                reason: "vram_required must be positive".to_string(),
            });
        }
        if req.vram_required > ceiling {
            return Err(SchedulerError::InvalidRequest {
                reason: format!(
                    "vram_required {} exceeds the {} ceiling for kind {:?}",
                    req.vram_required, ceiling, req.kind
                ),
            });
        }

        // a requirement no device can ever hold would queue forever
        let largest_device = self
            .pool
            .read()
            .expect("poisoned")
            .devices()
            .map(|d| d.total_vram)
            .max()
            .unwrap_or(0);
        if req.vram_required > largest_device {
            return Err(SchedulerError::InsufficientResource {
                required: req.vram_required,
            });
        }

        let task = Task::new(&req);
        let id = task.id;
        self.tasks.write().expect("poisoned").insert(task);

        if let Err(err) = self
            .queues
            .queue(req.priority)
            .push(id, self.config.admission_timeout())
            .await
        {
            // admission failed, drop the record again
            self.tasks.write().expect("poisoned").remove(&id);
            return Err(err);
        }
        tracing::debug!(task = %id, kind = %req.kind, priority = %req.priority, "task admitted");
        Ok(id)
    }

    pub fn status(&self, id: TaskId) -> Result<TaskView> {
        self.tasks
            .read()
            .expect("poisoned")
            .get(&id)
            .map(Task::view)
            .ok_or(SchedulerError::TaskNotFound { id })
    }

    /// Cancel a queued or running task. Terminal and unknown tasks report
    /// `TaskNotFound`, which makes a second cancel safe.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        enum Cleanup {
            Dequeue(Priority),
            Release(u64),
        }

        let cleanup = {
            let mut tasks = self.tasks.write().expect("poisoned");
            let task = tasks
                .get_mut(&id)
                .ok_or(SchedulerError::TaskNotFound { id })?;
            match task.status {
                TaskStatus::Queued => {
                    let priority = task.priority;
                    task.mark_terminal(TaskStatus::Cancelled, None, false);
                    Cleanup::Dequeue(priority)
                }
                TaskStatus::Running => {
                    if let Some(token) = task.run_token.take() {
                        token.cancel();
                    }
                    let vram = task.vram_required;
                    task.mark_terminal(TaskStatus::Cancelled, None, false);
                    Cleanup::Release(vram)
                }
                _ => return Err(SchedulerError::TaskNotFound { id }),
            }
        };

        match cleanup {
            Cleanup::Dequeue(priority) => {
                self.queues.queue(priority).remove(&id);
            }
            Cleanup::Release(vram) => {
                self.pool.write().expect("poisoned").release(&id, vram);
            }
        }
        tracing::info!(task = %id, "task cancelled");
        Ok(())
    }

    /// Start the per-priority queue workers
    pub fn spawn_workers(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for priority in Priority::LEVELS {
            for index in 0..self.config.workers_per_queue {
                let scheduler = self.clone();
                let token = token.clone();
                handles.push(tokio::spawn(async move {
                    scheduler.worker_loop(priority, index, token).await;
                }));
            }
        }
        handles
    }

    async fn worker_loop(self: Arc<Self>, priority: Priority, index: usize, token: CancellationToken) {
        tracing::debug!(%priority, index, "queue worker started");
        while let Some(id) = self.queues.queue(priority).pop(&token).await {
            if !self.is_queued(id) {
                continue; // cancelled while queued, entry is stale
            }
            // strict precedence across levels: stand aside while a more
            // urgent queue still has pending work
            if self.queues.has_pending_above(priority) {
                self.requeue_later(id, priority);
                continue;
            }
            match self.dispatch(id) {
                DispatchOutcome::Started | DispatchOutcome::Terminal => {}
                DispatchOutcome::NoCapacity => self.requeue_later(id, priority),
            }
        }
        tracing::debug!(%priority, index, "queue worker stopped");
    }

    /// Return a task to the tail of its queue after a short backoff, without
    /// blocking the worker that dequeued it.
    fn requeue_later(self: &Arc<Self>, id: TaskId, priority: Priority) {
        let scheduler = self.clone();
        let backoff = self.config.allocation_backoff();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            scheduler.queues.queue(priority).requeue(id);
        });
    }

    fn is_queued(&self, id: TaskId) -> bool {
        self.tasks
            .read()
            .expect("poisoned")
            .get(&id)
            .map(|t| t.status == TaskStatus::Queued)
            .unwrap_or(false)
    }

    /// The allocation engine: registry first, preemption second
    fn dispatch(self: &Arc<Self>, id: TaskId) -> DispatchOutcome {
        let (priority, vram_required) = {
            let tasks = self.tasks.read().expect("poisoned");
            match tasks.get(&id) {
                Some(t) if t.status == TaskStatus::Queued => (t.priority, t.vram_required),
                _ => return DispatchOutcome::Terminal,
            }
        };

        let alloc_started = Instant::now();
        let gpu = self
            .pool
            .write()
            .expect("poisoned")
            .allocate(id, vram_required);
        if let Some(gpu) = gpu {
            self.observe_allocation(alloc_started);
            self.start_execution(id, gpu);
            return DispatchOutcome::Started;
        }

        if !self.config.can_preempt(priority) {
            return DispatchOutcome::NoCapacity;
        }

        self.sink.counter("preemptions", &[("outcome", "attempted")], 1);
        let plan = {
            let tasks = self.tasks.read().expect("poisoned");
            let pool = self.pool.read().expect("poisoned");
            preempt::compute_plan(
                &pool,
                &tasks,
                priority,
                vram_required,
                self.config.reference_vram,
            )
        };
        let Some(plan) = plan else {
            self.sink.counter("preemptions", &[("outcome", "no_plan")], 1);
            return DispatchOutcome::NoCapacity;
        };

        match self.apply_plan(&plan, id, vram_required) {
            Ok(gpu) => {
                self.sink.counter("preemptions", &[("outcome", "success")], 1);
                self.observe_allocation(alloc_started);
                self.start_execution(id, gpu);
                DispatchOutcome::Started
            }
            Err(err) => {
                self.sink.counter("preemptions", &[("outcome", "failure")], 1);
                tracing::warn!(task = %id, "preemption failed: {err}");
                self.finish_unallocated(id, TaskStatus::Failed, Some(err.to_string()), true);
                DispatchOutcome::Terminal
            }
        }
    }

    /// Apply an eviction plan: release every victim back to its queue tail,
    /// then allocate the requester onto the freed device with the most
    /// headroom. Rolls the evictions back when the retry fails.
    fn apply_plan(
        self: &Arc<Self>,
        plan: &PreemptionPlan,
        requester: TaskId,
        vram_required: u64,
    ) -> Result<GpuId> {
        let mut evicted: Vec<(TaskId, Priority)> = Vec::new();
        let mut freed = 0u64;
        for victim in &plan.victims {
            if self.evict(victim) {
                freed += victim.vram;
                self.queues.queue(victim.priority).requeue(victim.task);
                evicted.push((victim.task, victim.priority));
            } else {
                tracing::debug!(task = %victim.task, "victim no longer running, skipping eviction");
            }
        }

        let target = {
            let mut pool = self.pool.write().expect("poisoned");
            let mut affected: Vec<GpuId> = plan.affected_devices.iter().copied().collect();
            affected.sort_by_key(|gpu| {
                std::cmp::Reverse(pool.device(*gpu).map(|d| d.free_vram()).unwrap_or(0))
            });
            affected
                .into_iter()
                .find(|gpu| pool.allocate_on(*gpu, requester, vram_required))
        };

        match target {
            Some(gpu) => Ok(gpu),
            None => {
                tracing::warn!(
                    task = %requester,
                    freed,
                    vram_required,
                    "freed capacity lost before retry, rolling back"
                );
                self.rollback(&evicted);
                Err(SchedulerError::PreemptionError {
                    reason: format!("allocation retry failed after freeing {freed} bytes"),
                })
            }
        }
    }

    /// Release one victim if it is still running where the plan saw it
    fn evict(&self, victim: &PreemptionCandidate) -> bool {
        {
            let mut tasks = self.tasks.write().expect("poisoned");
            let Some(task) = tasks.get_mut(&victim.task) else {
                return false;
            };
            if task.status != TaskStatus::Running || task.gpu_id != Some(victim.gpu) {
                return false;
            }
            if let Some(token) = task.run_token.take() {
                token.cancel();
            }
            task.mark_queued();
        }
        self.pool
            .write()
            .expect("poisoned")
            .release(&victim.task, victim.vram);
        tracing::info!(
            task = %victim.task,
            gpu = victim.gpu,
            score = victim.score,
            "task preempted"
        );
        true
    }

    /// Best-effort rollback of applied evictions through the normal
    /// allocation path; victims that cannot be re-placed stay queued.
    fn rollback(self: &Arc<Self>, evicted: &[(TaskId, Priority)]) {
        for (id, priority) in evicted {
            if !self.queues.queue(*priority).remove(id) {
                continue; // a worker already picked it up
            }
            let vram = {
                let tasks = self.tasks.read().expect("poisoned");
                match tasks.get(id) {
                    Some(t) if t.status == TaskStatus::Queued => t.vram_required,
                    _ => continue,
                }
            };
            match self.pool.write().expect("poisoned").allocate(*id, vram) {
                Some(gpu) => {
                    tracing::info!(task = %id, gpu, "preempted task re-admitted during rollback");
                    self.start_execution(*id, gpu);
                }
                None => {
                    tracing::warn!(task = %id, "rollback could not re-place preempted task");
                    self.queues.queue(*priority).requeue(*id);
                }
            }
        }
    }

    /// Commit an allocated task and spawn its execution watcher
    fn start_execution(self: &Arc<Self>, id: TaskId, gpu: GpuId) {
        let run_token = CancellationToken::new();
        let prepared = {
            let mut tasks = self.tasks.write().expect("poisoned");
            match tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Queued => {
                    task.mark_running(gpu, run_token.clone());
                    Ok((
                        TaskSpec {
                            id,
                            kind: task.kind.clone(),
                            priority: task.priority,
                            vram_required: task.vram_required,
                            gpu_id: gpu,
                            estimated_duration: task.estimated_duration,
                        },
                        task.execution_timeout
                            .unwrap_or_else(|| self.config.default_execution_timeout()),
                    ))
                }
                // cancelled between allocation and commit; undo the hold
                Some(task) => Err(task.vram_required),
                None => Err(0),
            }
        };

        match prepared {
            Ok((spec, timeout)) => {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.watch_execution(spec, run_token, timeout).await;
                });
            }
            Err(vram) => {
                self.pool.write().expect("poisoned").release(&id, vram);
            }
        }
    }

    /// Await the backend's completion signal for one run
    async fn watch_execution(
        self: Arc<Self>,
        spec: TaskSpec,
        run_token: CancellationToken,
        timeout: Duration,
    ) {
        let id = spec.id;
        let handle = match self.backend.execute(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(task = %id, "execution backend refused the task: {e:#}");
                self.release_and_finish(
                    id,
                    TaskStatus::Failed,
                    Some(format!("execution backend: {e}")),
                    true,
                );
                return;
            }
        };

        tokio::select! {
            _ = run_token.cancelled() => {
                // cancellation, preemption and failover do their own
                // bookkeeping before firing the token
                tracing::debug!(task = %id, "execution watcher detached");
            }
            outcome = handle.wait() => match outcome {
                ExecutionOutcome::Success => {
                    self.release_and_finish(id, TaskStatus::Completed, None, false);
                }
                ExecutionOutcome::Failure { reason } => {
                    self.release_and_finish(id, TaskStatus::Failed, Some(reason), false);
                }
            },
            _ = tokio::time::sleep(timeout) => {
                let err = SchedulerError::ExecutionTimeout { seconds: timeout.as_secs() };
                self.release_and_finish(id, TaskStatus::Failed, Some(err.to_string()), false);
            }
        }
    }

    /// Terminal transition for a running task, releasing its device
    fn release_and_finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
        retriable: bool,
    ) {
        let vram = {
            let mut tasks = self.tasks.write().expect("poisoned");
            match tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Running => {
                    let vram = task.vram_required;
                    task.mark_terminal(status, error, retriable);
                    vram
                }
                _ => return, // lost the race against cancel or preemption
            }
        };
        self.pool.write().expect("poisoned").release(&id, vram);
        tracing::info!(task = %id, %status, "task finished");
    }

    /// Terminal transition for a task that holds no allocation
    fn finish_unallocated(
        &self,
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
        retriable: bool,
    ) {
        let mut tasks = self.tasks.write().expect("poisoned");
        if let Some(task) = tasks.get_mut(&id) {
            if !task.status.is_terminal() {
                task.mark_terminal(status, error, retriable);
            }
        }
    }

    /// Move a task off a failed device and re-drive it through the
    /// allocation engine. Tasks that cannot be placed anywhere fail with
    /// `retriable = true`; the compute state cannot be hot-migrated.
    pub(crate) fn reassign_from_failed(self: &Arc<Self>, id: TaskId, failed_gpu: GpuId) {
        let vram = {
            let mut tasks = self.tasks.write().expect("poisoned");
            match tasks.get_mut(&id) {
                Some(task)
                    if task.status == TaskStatus::Running && task.gpu_id == Some(failed_gpu) =>
                {
                    if let Some(token) = task.run_token.take() {
                        token.cancel();
                    }
                    task.mark_queued();
                    task.vram_required
                }
                _ => return,
            }
        };
        self.pool.write().expect("poisoned").release(&id, vram);

        match self.dispatch(id) {
            DispatchOutcome::Started => {
                tracing::info!(task = %id, from_gpu = failed_gpu, "task reassigned off failed device");
            }
            DispatchOutcome::NoCapacity => {
                let err = SchedulerError::DeviceFailed { gpu: failed_gpu };
                self.finish_unallocated(id, TaskStatus::Failed, Some(err.to_string()), true);
                tracing::warn!(task = %id, gpu = failed_gpu, "no replacement device, task failed as retriable");
            }
            DispatchOutcome::Terminal => {}
        }
    }

    fn observe_allocation(&self, since: Instant) {
        self.sink
            .histogram("allocation_latency_seconds", &[], since.elapsed().as_secs_f64());
    }

    /// Cloned view of the device table for metrics and diagnostics
    pub fn device_snapshot(&self) -> Vec<GpuDevice> {
        self.pool
            .read()
            .expect("poisoned")
            .devices()
            .cloned()
            .collect()
    }

    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queues
            .iter()
            .map(|q| QueueStats {
                priority: q.priority(),
                depth: q.depth(),
                oldest_wait: q.oldest_wait(),
            })
            .collect()
    }

    pub(crate) fn pool(&self) -> &RwLock<GpuPool> {
        &self.pool
    }
}
