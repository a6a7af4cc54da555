//! Task queue: an unbounded FIFO of work items protected by a mutex and a
//! "not-empty" condition.
//!
//! The slot vector only grows, in fixed chunks, and the head/tail cursors
//! advance monotonically; consumed slots are left behind until the queue is
//! reset at release time. This mirrors the accounting the pool exposes:
//! `todo` is the backlog, `total` the accumulated submission count.

use crate::error::AccessorError;
use crate::Result;
use log::trace;
use std::sync::{Condvar, Mutex};

/// Number of task slots added per growth step. The request registry grows in
/// the same chunk size.
pub const QUEUE_CHUNK: usize = 1024;

/// One unit of work for the pool, or a sentinel that releases a worker.
pub struct Task {
    job: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Task {
    /// A task carrying a work payload.
    pub fn new(job: impl FnOnce() + Send + 'static) -> Task {
        Task {
            job: Some(Box::new(job)),
        }
    }

    /// A poison pill: no payload, terminates one worker during shutdown.
    pub fn sentinel() -> Task {
        Task { job: None }
    }

    pub fn is_sentinel(&self) -> bool {
        self.job.is_none()
    }

    /// Consume the task and run its payload, if any.
    pub(crate) fn run(self) {
        if let Some(job) = self.job {
            job();
        }
    }
}

#[derive(Default)]
struct QueueInner {
    slots: Vec<Option<Task>>,
    head: usize,
    tail: usize,
    todo: usize,
    total: usize,
}

/// FIFO of pending work items. Clone-free: lives inside the pool and is
/// shared by reference.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue {
            inner: Mutex::new(QueueInner::default()),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue a task and signal the not-empty condition.
    ///
    /// Capacity grows by [`QUEUE_CHUNK`] whenever the accumulated total
    /// crosses a chunk boundary; a failed growth surfaces `NoMemory` and
    /// leaves the queue unchanged.
    pub fn push(&self, task: Task) -> Result<()> {
        let mut q = self.inner.lock().unwrap();
        if q.total % QUEUE_CHUNK == 0 {
            if let Err(err) = q.slots.try_reserve_exact(QUEUE_CHUNK) {
                return Err(AccessorError::NoMemory(format!(
                    "task queue growth failed: {err}"
                )));
            }
        }
        q.slots.push(Some(task));
        q.tail += 1;
        q.todo += 1;
        q.total += 1;
        trace!(
            "task enqueued: total[{}] todo[{}] done[{}]",
            q.total,
            q.todo,
            q.total - q.todo
        );
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until a task is available, then take the one at the head.
    /// Dequeue order equals enqueue order.
    pub fn pop(&self) -> Task {
        let mut q = self.inner.lock().unwrap();
        while q.todo == 0 {
            q = self.not_empty.wait(q).unwrap();
        }
        let head = q.head;
        let task = q.slots[head].take().expect("task slot consumed twice");
        q.head += 1;
        q.todo -= 1;
        trace!(
            "task acquired: total[{}] todo[{}] done[{}]",
            q.total,
            q.todo,
            q.total - q.todo
        );
        task
    }

    /// Backlog of not-yet-consumed tasks.
    pub fn todo(&self) -> usize {
        self.inner.lock().unwrap().todo
    }

    /// Accumulated number of submissions since the last reset.
    pub fn total(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    pub fn is_empty(&self) -> bool {
        self.todo() == 0
    }

    /// Drop all slots and zero the cursors. Only called when no worker is
    /// parked on the queue.
    pub fn reset(&self) {
        let mut q = self.inner.lock().unwrap();
        *q = QueueInner::default();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn sentinel_has_no_payload() {
        assert!(Task::sentinel().is_sentinel());
        assert!(!Task::new(|| {}).is_sentinel());
    }

    #[test]
    fn dequeue_order_matches_enqueue_order() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..32 {
            let seen = Arc::clone(&seen);
            queue.push(Task::new(move || seen.lock().unwrap().push(i))).unwrap();
        }
        for _ in 0..32 {
            queue.pop().run();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..32).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn grows_past_chunk_boundary_without_losing_tasks() {
        let queue = TaskQueue::new();
        let count = 2 * QUEUE_CHUNK + 1;
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..count {
            let ran = Arc::clone(&ran);
            queue
                .push(Task::new(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        assert_eq!(queue.total(), count);
        assert_eq!(queue.todo(), count);

        for _ in 0..count {
            queue.pop().run();
        }
        assert_eq!(ran.load(Ordering::Relaxed), count);
        assert!(queue.is_empty());
        assert_eq!(queue.total(), count);
    }

    #[test]
    fn reset_zeroes_the_counters() {
        let queue = TaskQueue::new();
        queue.push(Task::new(|| {})).unwrap();
        queue.pop().run();
        queue.reset();
        assert_eq!(queue.total(), 0);
        assert!(queue.is_empty());
    }
}
