//! Worker pool: a fixed set of long-lived threads draining the task queue.
//!
//! Workers park on the queue's not-empty condition and update the pool's
//! busy/idle accounting around every task. Shutdown is sentinel-driven: the
//! running flag flips off, one poison pill per worker is flushed through the
//! queue, and each worker exits the first time it dequeues one. Already
//! queued work still runs before its worker meets a sentinel, so a draining
//! pool finishes what was admitted.
//!
//! The pool initialises lazily and can be restarted after a shutdown; the
//! accessor that embeds it calls `ensure_running` on every request creation.

pub mod queue;

use crate::error::AccessorError;
use crate::Result;
use log::{debug, trace, warn};
use queue::{Task, TaskQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Number of worker threads serving an accessor.
pub const POOL_SIZE: usize = 10;

/// Live thread accounting. `alive == busy + idle` whenever no thread is
/// mid-transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolInfo {
    /// Next worker index to hand out; grows across restarts.
    pub max_thread_idx: usize,
    pub alive: usize,
    pub busy: usize,
    pub idle: usize,
}

struct PoolShared {
    queue: TaskQueue,
    info: Mutex<PoolInfo>,
    running: AtomicBool,
}

/// Fixed-size worker pool over a chunk-grown task queue.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    initialized: Mutex<bool>,
    size: usize,
}

impl ThreadPool {
    /// Create a pool shell; no threads are spawned until `ensure_running`.
    pub fn new(size: usize) -> ThreadPool {
        assert!(size > 0, "pool needs at least one worker");
        ThreadPool {
            shared: Arc::new(PoolShared {
                queue: TaskQueue::new(),
                info: Mutex::new(PoolInfo::default()),
                running: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
            initialized: Mutex::new(false),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Snapshot of the thread accounting.
    pub fn info(&self) -> PoolInfo {
        *self.shared.info.lock().unwrap()
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }

    /// Spawn the workers if the pool is not initialised (first use, or first
    /// use after a shutdown).
    pub fn ensure_running(&self) {
        let mut initialized = self.initialized.lock().unwrap();
        if *initialized {
            return;
        }
        debug!("initialising worker pool with {} threads", self.size);
        self.shared.running.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.size {
            let shared = Arc::clone(&self.shared);
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }
        *initialized = true;
    }

    /// Admission rule: work is accepted only while the pool runs; sentinels
    /// only while it is shutting down. A sentinel handed to a running pool
    /// is a programming error and is ignored.
    pub fn submit(&self, task: Task) -> Result<()> {
        let running = self.is_running();
        if running && task.is_sentinel() {
            debug_assert!(false, "sentinel submitted to a running pool");
            warn!("sentinel task ignored: pool still running");
            return Ok(());
        }
        if !running && !task.is_sentinel() {
            warn!("thread pool is closing, task rejected");
            return Err(AccessorError::AlreadyExists(
                "thread pool is not running".into(),
            ));
        }
        self.shared.queue.push(task)
    }

    /// Flip the running flag, flush one sentinel per worker, join them all,
    /// and reset the queue. A pool that was never started is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().unwrap();
        if !*initialized {
            return Ok(());
        }
        self.shared.running.store(false, Ordering::Release);
        for _ in 0..self.size {
            self.submit(Task::sentinel())?;
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            if handle.join().is_err() {
                warn!("worker thread panicked before join");
            }
        }
        *initialized = false;
        self.shared.queue.reset();
        debug!("worker pool drained; state {:?}", self.info());
        Ok(())
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let idx;
    {
        let mut info = shared.info.lock().unwrap();
        idx = info.max_thread_idx;
        info.max_thread_idx += 1;
        info.alive += 1;
        info.idle += 1;
        trace!("worker[{idx}] up; pool state {:?}", *info);
    }

    loop {
        let task = shared.queue.pop();

        if task.is_sentinel() {
            if !shared.running.load(Ordering::Acquire) {
                let mut info = shared.info.lock().unwrap();
                info.alive -= 1;
                info.idle -= 1;
                trace!("worker[{idx}] released by sentinel; pool state {:?}", *info);
                break;
            }
            // Admission should have filtered this; see ThreadPool::submit.
            debug_assert!(false, "sentinel task dequeued while pool running");
            warn!("worker[{idx}] ignoring sentinel on a running pool");
            continue;
        }

        {
            let mut info = shared.info.lock().unwrap();
            info.busy += 1;
            info.idle -= 1;
            trace!("worker[{idx}] busy; pool state {:?}", *info);
        }

        task.run();

        {
            let mut info = shared.info.lock().unwrap();
            info.busy -= 1;
            info.idle += 1;
            trace!("worker[{idx}] idle; pool state {:?}", *info);
        }
    }
}
