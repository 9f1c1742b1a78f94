//! Preemption planning
//!
//! Plan computation is pure: it reads a snapshot of the pool and task table
//! and produces a `PreemptionPlan` value. Applying a plan (and rolling it
//! back) is the scheduler's job, keeping the two phases separate.

use std::collections::HashSet;

use api_types::{GpuId, Priority, TaskId, MAX_PRIORITY};
use priority_queue::PriorityQueue;

use crate::pool::GpuPool;
use crate::task::TaskTable;

/// Total-ordered score so candidates can live in a priority queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One running task the planner may evict
#[derive(Debug, Clone)]
pub struct PreemptionCandidate {
    pub task: TaskId,
    pub gpu: GpuId,
    pub vram: u64,
    pub priority: Priority,
    pub score: f64,
}

/// An accepted eviction plan; applying it frees at least the requested VRAM
#[derive(Debug, Clone)]
pub struct PreemptionPlan {
    /// Victims in eviction order (best score first)
    pub victims: Vec<PreemptionCandidate>,
    pub total_vram_freed: u64,
    pub affected_devices: HashSet<GpuId>,
}

/// Victim desirability. The priority term follows the numeric scale
/// (0 = realtime), so among eligible victims the formula favors the ones
/// closest to the requester's level, then recently started, VRAM-heavy tasks
/// on well-connected devices.
fn victim_score(
    priority: Priority,
    runtime_secs: f64,
    vram: u64,
    peer_count: usize,
    pool_size: usize,
    reference_vram: u64,
) -> f64 {
    0.4 * (1.0 - priority.as_u8() as f64 / MAX_PRIORITY as f64)
        + 0.3 * (1.0 / (1.0 + runtime_secs / 3600.0))
        + 0.2 * (vram as f64 / reference_vram as f64)
        + 0.1 * (peer_count as f64 / pool_size.max(1) as f64)
}

/// Compute an eviction plan freeing at least `vram_required` bytes for a
/// requester at `priority`. Pure: no side effects on pool or table.
///
/// Returns `None` when every eligible victim together is not enough, or when
/// the plan would touch more than half the pool's devices.
pub(crate) fn compute_plan(
    pool: &GpuPool,
    tasks: &TaskTable,
    priority: Priority,
    vram_required: u64,
    reference_vram: u64,
) -> Option<PreemptionPlan> {
    let pool_size = pool.len();
    let mut candidates: PriorityQueue<TaskId, Score> = PriorityQueue::new();
    let mut meta = std::collections::HashMap::new();

    for task in tasks.running() {
        if task.priority <= priority {
            continue; // only strictly lower-priority work is evictable
        }
        let Some(gpu) = task.gpu_id else { continue };
        let peer_count = pool.device(gpu).map(|d| d.nvlink_peers.len()).unwrap_or(0);
        let score = victim_score(
            task.priority,
            task.runtime_secs(),
            task.vram_required,
            peer_count,
            pool_size,
            reference_vram,
        );
        candidates.push(task.id, Score(score));
        meta.insert(task.id, (gpu, task.vram_required, task.priority, score));
    }

    let mut victims = Vec::new();
    let mut affected_devices = HashSet::new();
    let mut total_vram_freed = 0u64;

    while total_vram_freed < vram_required {
        let Some((id, _)) = candidates.pop() else {
            tracing::debug!(
                vram_required,
                total_vram_freed,
                "preemption planning aborted, eligible victims insufficient"
            );
            return None;
        };
        let (gpu, vram, victim_priority, score) = meta[&id];
        total_vram_freed += vram;
        affected_devices.insert(gpu);
        victims.push(PreemptionCandidate {
            task: id,
            gpu,
            vram,
            priority: victim_priority,
            score,
        });
    }

    // bound the blast radius: never touch more than half the pool
    if affected_devices.len() * 2 > pool_size {
        tracing::debug!(
            affected = affected_devices.len(),
            pool_size,
            "preemption plan rejected, blast radius too large"
        );
        return None;
    }

    Some(PreemptionPlan {
        victims,
        total_vram_freed,
        affected_devices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::GpuDevice;
    use crate::task::Task;
    use api_types::SubmitRequest;
    use tokio_util::sync::CancellationToken;

    const GIB: u64 = 1024 * 1024 * 1024;
    const REFERENCE_VRAM: u64 = 24 * GIB;

    fn running_task(
        table: &mut TaskTable,
        pool: &mut GpuPool,
        priority: Priority,
        vram: u64,
        gpu: GpuId,
        runtime_secs: i64,
    ) -> TaskId {
        let mut task = Task::new(&SubmitRequest {
            kind: "image".to_string(),
            priority,
            vram_required: vram,
            estimated_duration_secs: None,
            execution_timeout_secs: None,
        });
        task.mark_running(gpu, CancellationToken::new());
        task.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(runtime_secs));
        let id = task.id;
        assert!(pool.allocate_on(gpu, id, vram), "fixture must fit on device {gpu}");
        table.insert(task);
        id
    }

    fn two_device_pool() -> GpuPool {
        GpuPool::new(vec![
            GpuDevice::new(0, 24 * GIB, [1].into_iter().collect()),
            GpuDevice::new(1, 24 * GIB, [0].into_iter().collect()),
        ])
    }

    #[test]
    fn priority_term_follows_the_numeric_scale() {
        let batch = victim_score(Priority::Batch, 60.0, 8 * GIB, 1, 2, REFERENCE_VRAM);
        let normal = victim_score(Priority::Normal, 60.0, 8 * GIB, 1, 2, REFERENCE_VRAM);
        assert!(normal > batch, "1 - priority/MAX ranks numerically lower levels first");
    }

    #[test]
    fn younger_runs_score_higher() {
        let fresh = victim_score(Priority::Batch, 10.0, 8 * GIB, 1, 2, REFERENCE_VRAM);
        let old = victim_score(Priority::Batch, 7200.0, 8 * GIB, 1, 2, REFERENCE_VRAM);
        assert!(fresh > old);
    }

    #[test]
    fn selects_the_single_best_victim_when_it_suffices() {
        let mut pool = two_device_pool();
        let mut table = TaskTable::default();
        running_task(&mut table, &mut pool, Priority::Batch, 20 * GIB, 0, 30);
        let normal = running_task(&mut table, &mut pool, Priority::Normal, 20 * GIB, 1, 30);

        let plan =
            compute_plan(&pool, &table, Priority::Realtime, 20 * GIB, REFERENCE_VRAM).unwrap();
        assert_eq!(plan.victims.len(), 1);
        assert_eq!(
            plan.victims[0].task, normal,
            "the priority term ranks the normal victim above batch"
        );
        assert_eq!(plan.total_vram_freed, 20 * GIB);
        assert_eq!(plan.affected_devices.len(), 1);
    }

    #[test]
    fn accepted_plans_always_free_enough() {
        let mut pool = two_device_pool();
        let mut table = TaskTable::default();
        for _ in 0..3 {
            running_task(&mut table, &mut pool, Priority::Batch, 6 * GIB, 0, 60);
        }

        let required = 16 * GIB;
        let plan =
            compute_plan(&pool, &table, Priority::High, required, REFERENCE_VRAM).unwrap();
        assert!(plan.total_vram_freed >= required);
        assert_eq!(plan.victims.len(), 3, "two victims free only 12 GiB");
    }

    #[test]
    fn no_plan_when_eligible_victims_are_insufficient() {
        let mut pool = two_device_pool();
        let mut table = TaskTable::default();
        running_task(&mut table, &mut pool, Priority::Batch, 4 * GIB, 0, 60);

        assert!(compute_plan(&pool, &table, Priority::Realtime, 20 * GIB, REFERENCE_VRAM).is_none());
    }

    #[test]
    fn equal_priority_work_is_never_a_victim() {
        let mut pool = two_device_pool();
        let mut table = TaskTable::default();
        running_task(&mut table, &mut pool, Priority::High, 20 * GIB, 0, 60);

        assert!(compute_plan(&pool, &table, Priority::High, 20 * GIB, REFERENCE_VRAM).is_none());
    }

    #[test]
    fn plans_touching_more_than_half_the_pool_are_rejected() {
        let mut pool = two_device_pool();
        let mut table = TaskTable::default();
        running_task(&mut table, &mut pool, Priority::Batch, 12 * GIB, 0, 60);
        running_task(&mut table, &mut pool, Priority::Batch, 12 * GIB, 1, 60);

        // freeing 20 GiB needs both devices, which is the whole pool
        assert!(compute_plan(&pool, &table, Priority::Realtime, 20 * GIB, REFERENCE_VRAM).is_none());
    }

    #[test]
    fn queued_tasks_are_not_candidates() {
        let mut pool = two_device_pool();
        let mut table = TaskTable::default();
        table.insert(Task::new(&SubmitRequest {
            kind: "video".to_string(),
            priority: Priority::Batch,
            vram_required: 20 * GIB,
            estimated_duration_secs: None,
            execution_timeout_secs: None,
        }));

        assert!(compute_plan(&pool, &table, Priority::Realtime, GIB, REFERENCE_VRAM).is_none());
    }
}
