//! Bounded FIFO admission queues, one per priority level
//!
//! Queues hold task ids only; the task table stays the single owner of the
//! records. Admission blocks up to a timeout when the queue is full (the
//! backpressure mechanism), workers block on pop, and cancellation removes
//! entries from the middle.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use api_types::{Priority, TaskId};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    id: TaskId,
    enqueued_at: Instant,
}

/// A bounded FIFO queue of task ids
#[derive(Debug)]
pub struct TaskQueue {
    priority: Priority,
    capacity: usize,
    entries: Mutex<VecDeque<QueueEntry>>,
    /// Signalled whenever an entry is pushed
    items: Notify,
    /// Signalled whenever a slot frees up
    space: Notify,
}

impl TaskQueue {
    pub fn new(priority: Priority, capacity: usize) -> Self {
        Self {
            priority,
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Enqueue at the tail, waiting up to `timeout` for a free slot.
    /// Fails with `QueueFull` once the timeout elapses.
    pub async fn push(&self, id: TaskId, timeout: Duration) -> Result<(), SchedulerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // register interest before checking, so a pop between the check
            // and the await is not lost
            let notified = self.space.notified();
            {
                let mut entries = self.entries.lock().expect("poisoned");
                if entries.len() < self.capacity {
                    entries.push_back(QueueEntry {
                        id,
                        enqueued_at: Instant::now(),
                    });
                    drop(entries);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SchedulerError::QueueFull {
                    priority: self.priority,
                });
            }
        }
    }

    /// Enqueue at the tail regardless of capacity. Used for preempted victims
    /// and allocation retries, which must never bounce with `QueueFull`.
    pub fn requeue(&self, id: TaskId) {
        self.entries
            .lock()
            .expect("poisoned")
            .push_back(QueueEntry {
                id,
                enqueued_at: Instant::now(),
            });
        self.items.notify_one();
    }

    /// Dequeue FIFO, waiting until an entry is available or the token fires.
    /// Returns `None` on cancellation.
    pub async fn pop(&self, token: &CancellationToken) -> Option<TaskId> {
        loop {
            let notified = self.items.notified();
            {
                let mut entries = self.entries.lock().expect("poisoned");
                if let Some(entry) = entries.pop_front() {
                    drop(entries);
                    self.space.notify_one();
                    return Some(entry.id);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = token.cancelled() => return None,
            }
        }
    }

    /// Remove a specific entry (cancellation of a queued task).
    /// Returns whether the entry was present.
    pub fn remove(&self, id: &TaskId) -> bool {
        let mut entries = self.entries.lock().expect("poisoned");
        let before = entries.len();
        entries.retain(|e| e.id != *id);
        let removed = entries.len() < before;
        drop(entries);
        if removed {
            self.space.notify_one();
        }
        removed
    }

    pub fn depth(&self) -> usize {
        self.entries.lock().expect("poisoned").len()
    }

    /// How long the head entry has been waiting
    pub fn oldest_wait(&self) -> Option<Duration> {
        self.entries
            .lock()
            .expect("poisoned")
            .front()
            .map(|e| e.enqueued_at.elapsed())
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// The per-priority queue family
#[derive(Debug)]
pub struct QueueSet {
    queues: Vec<TaskQueue>,
}

impl QueueSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Priority::LEVELS
                .iter()
                .map(|&p| TaskQueue::new(p, capacity))
                .collect(),
        }
    }

    pub fn queue(&self, priority: Priority) -> &TaskQueue {
        &self.queues[priority.as_u8() as usize]
    }

    /// Whether any strictly more urgent queue still has pending work
    pub fn has_pending_above(&self, priority: Priority) -> bool {
        self.queues[..priority.as_u8() as usize]
            .iter()
            .any(|q| q.depth() > 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskQueue> {
        self.queues.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn pop_preserves_fifo_order() {
        let queue = TaskQueue::new(Priority::Normal, 8);
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
        for id in &ids {
            queue.push(*id, TIMEOUT).await.unwrap();
        }

        let token = CancellationToken::new();
        for id in &ids {
            assert_eq!(queue.pop(&token).await, Some(*id));
        }
    }

    #[tokio::test]
    async fn full_queue_rejects_after_timeout() {
        let queue = TaskQueue::new(Priority::Batch, 2);
        queue.push(TaskId::new(), TIMEOUT).await.unwrap();
        queue.push(TaskId::new(), TIMEOUT).await.unwrap();

        let err = queue.push(TaskId::new(), TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::QueueFull {
                priority: Priority::Batch
            }
        ));
    }

    #[tokio::test]
    async fn push_succeeds_once_a_slot_frees_up() {
        let queue = std::sync::Arc::new(TaskQueue::new(Priority::Normal, 1));
        let blocker = TaskId::new();
        queue.push(blocker, TIMEOUT).await.unwrap();

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.pop(&CancellationToken::new()).await
            })
        };

        queue
            .push(TaskId::new(), Duration::from_secs(1))
            .await
            .expect("push should succeed after the blocking entry is popped");
        assert_eq!(popper.await.unwrap(), Some(blocker));
    }

    #[tokio::test]
    async fn requeue_bypasses_the_capacity_bound() {
        let queue = TaskQueue::new(Priority::Normal, 1);
        queue.push(TaskId::new(), TIMEOUT).await.unwrap();
        queue.requeue(TaskId::new());
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn remove_pulls_an_entry_out_of_the_middle() {
        let queue = TaskQueue::new(Priority::Normal, 8);
        let first = TaskId::new();
        let victim = TaskId::new();
        let last = TaskId::new();
        for id in [first, victim, last] {
            queue.push(id, TIMEOUT).await.unwrap();
        }

        assert!(queue.remove(&victim));
        assert!(!queue.remove(&victim), "second removal finds nothing");

        let token = CancellationToken::new();
        assert_eq!(queue.pop(&token).await, Some(first));
        assert_eq!(queue.pop(&token).await, Some(last));
    }

    #[tokio::test]
    async fn pop_returns_none_on_cancellation() {
        let queue = TaskQueue::new(Priority::Normal, 8);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(queue.pop(&token).await, None);
    }

    #[tokio::test]
    async fn has_pending_above_only_looks_at_more_urgent_levels() {
        let set = QueueSet::new(8);
        set.queue(Priority::High).requeue(TaskId::new());

        assert!(set.has_pending_above(Priority::Normal));
        assert!(set.has_pending_above(Priority::Batch));
        assert!(!set.has_pending_above(Priority::High));
        assert!(!set.has_pending_above(Priority::Realtime));
    }
}
