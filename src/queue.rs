//! Bounded, priority-ordered task queue.
//!
//! Primary ordering key is priority descending; secondary key is enqueue
//! time ascending (FIFO within a priority band). An optional aging function
//! lets an older task's *effective* priority climb over time so bulk
//! low-priority submissions can't starve it indefinitely.

use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::task::Task;

/// Errors raised by [`TaskQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `enqueue` was called while the queue was already at `max_size`.
    #[error("queue full (capacity {capacity})")]
    Full {
        /// The queue's configured capacity.
        capacity: usize,
    },
}

/// A function computing additional effective priority from how long a task
/// has been waiting. Applied additively on top of the task's own priority.
pub type AgingFn = std::sync::Arc<dyn Fn(Duration) -> f64 + Send + Sync>;

struct Entry {
    task: Task,
    enqueued_at: Instant,
    seq: u64,
}

struct Inner {
    entries: Vec<Entry>,
    next_seq: u64,
}

/// Bounded priority queue of pending [`Task`]s.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_size: usize,
    aging: Option<AgingFn>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("max_size", &self.max_size).finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Construct an empty queue bounded at `max_size` entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: Vec::new(), next_seq: 0 }),
            notify: Notify::new(),
            max_size,
            aging: None,
        }
    }

    /// Construct a queue that additionally ages tasks by `aging`.
    pub fn with_aging(max_size: usize, aging: AgingFn) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: Vec::new(), next_seq: 0 }),
            notify: Notify::new(),
            max_size,
            aging: Some(aging),
        }
    }

    /// Insert `task`. Fails with [`QueueError::Full`] if the queue is
    /// already at capacity.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.max_size {
            return Err(QueueError::Full { capacity: self.max_size });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(Entry { task, enqueued_at: Instant::now(), seq });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the highest-priority (then earliest-enqueued) task.
    /// Blocks up to `deadline` if the queue is empty, returning `None` if it
    /// is still empty once the deadline elapses. `None` deadline means
    /// "return immediately if empty."
    pub async fn dequeue(&self, deadline: Option<Duration>) -> Option<Task> {
        let started = Instant::now();
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(index) = self.best_index(&inner) {
                    return Some(inner.entries.remove(index).task);
                }
            }
            let Some(deadline) = deadline else { return None };
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return None;
            }
            let remaining = deadline - elapsed;
            let notified = self.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    fn best_index(&self, inner: &Inner) -> Option<usize> {
        if inner.entries.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut best: Option<(usize, f64, u64)> = None;
        for (i, entry) in inner.entries.iter().enumerate() {
            let effective = self.effective_priority(entry, now);
            let key = (effective, entry.seq);
            let better = match &best {
                None => true,
                Some((_, best_effective, best_seq)) => {
                    key.0 > *best_effective || (key.0 == *best_effective && key.1 < *best_seq)
                }
            };
            if better {
                best = Some((i, key.0, key.1));
            }
        }
        best.map(|(i, _, _)| i)
    }

    fn effective_priority(&self, entry: &Entry, now: Instant) -> f64 {
        let base = f64::from(entry.task.priority);
        match &self.aging {
            Some(aging) => base + aging(now.saturating_duration_since(entry.enqueued_at)),
            None => base,
        }
    }

    /// Current number of resident tasks.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Snapshot of resident tasks in current dispatch order (does not
    /// consume them).
    pub async fn snapshot(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut indices: Vec<usize> = (0..inner.entries.len()).collect();
        let now = Instant::now();
        indices.sort_by(|&a, &b| {
            let ea = self.effective_priority(&inner.entries[a], now);
            let eb = self.effective_priority(&inner.entries[b], now);
            eb.partial_cmp(&ea)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(inner.entries[a].seq.cmp(&inner.entries[b].seq))
        });
        indices.into_iter().map(|i| inner.entries[i].task.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn task(id: &str, priority: u8) -> Task {
        Task {
            task_id: id.into(),
            task_type: TaskType::Generic,
            description: String::new(),
            files: vec![],
            parallel: false,
            subtasks: vec![],
            priority,
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task("a", 1)).await.unwrap();
        queue.enqueue(task("b", 9)).await.unwrap();
        queue.enqueue(task("c", 5)).await.unwrap();
        let first = queue.dequeue(None).await.unwrap();
        let second = queue.dequeue(None).await.unwrap();
        let third = queue.dequeue(None).await.unwrap();
        assert_eq!(first.task_id, "b");
        assert_eq!(second.task_id, "c");
        assert_eq!(third.task_id, "a");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task("a", 5)).await.unwrap();
        queue.enqueue(task("b", 5)).await.unwrap();
        queue.enqueue(task("c", 5)).await.unwrap();
        assert_eq!(queue.dequeue(None).await.unwrap().task_id, "a");
        assert_eq!(queue.dequeue(None).await.unwrap().task_id, "b");
        assert_eq!(queue.dequeue(None).await.unwrap().task_id, "c");
    }

    #[tokio::test]
    async fn enqueue_past_capacity_fails() {
        let queue = TaskQueue::new(1);
        queue.enqueue(task("a", 5)).await.unwrap();
        assert!(matches!(queue.enqueue(task("b", 5)).await, Err(QueueError::Full { capacity: 1 })));
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none_without_deadline() {
        let queue = TaskQueue::new(10);
        assert!(queue.dequeue(None).await.is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_as_soon_as_a_task_is_enqueued() {
        let queue = std::sync::Arc::new(TaskQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(task("a", 5)).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result.unwrap().task_id, "a");
    }

    #[tokio::test]
    async fn aging_lets_an_old_low_priority_task_overtake() {
        let aging: AgingFn = std::sync::Arc::new(|age: Duration| age.as_secs_f64() * 10.0);
        let queue = TaskQueue::with_aging(10, aging);
        queue.enqueue(task("old", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(task("new", 5)).await.unwrap();
        // "old" has aged ~0.5+ effective priority points by now, not yet enough
        // to overtake a fresh priority-5 task submitted immediately after it.
        let first = queue.dequeue(None).await.unwrap();
        assert_eq!(first.task_id, "new");
    }

    #[tokio::test]
    async fn snapshot_does_not_consume_entries() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task("a", 5)).await.unwrap();
        let snap = queue.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(queue.size().await, 1);
    }
}
