use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};

use crate::routes::JobMessage;

/// Admission was refused because the queue is at its configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Bounded FIFO of pending execution records, owned by the scheduler and
/// injected everywhere it is needed. Workers block on `pop`; the counters
/// feed the health/monitoring surface.
pub struct JobQueue {
    queue: Mutex<VecDeque<JobMessage>>,
    notify: Notify,
    max_size: usize,
    depth: AtomicUsize,
    enqueued: AtomicU64,
    processing: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub max_size: usize,
    pub enqueued: u64,
    pub processing: usize,
    pub succeeded: u64,
    pub failed: u64,
}

impl JobQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_size,
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            processing: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Admits a job unless the queue is full. The depth check and the push
    /// happen under the same lock, so the bound is never exceeded.
    pub async fn try_push(&self, job: JobMessage) -> Result<(), QueueFull> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_size {
            return Err(QueueFull);
        }
        queue.push_back(job);
        drop(queue);

        self.depth.fetch_add(1, Ordering::SeqCst);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }

    /// Removes the oldest job, waiting for one to arrive if the queue is
    /// empty. The job counts as processing until `mark_finished` is called.
    pub async fn pop(&self) -> JobMessage {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                self.processing.fetch_add(1, Ordering::SeqCst);
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn mark_finished(&self, success: bool) {
        self.processing.fetch_sub(1, Ordering::SeqCst);
        if success {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_full(&self) -> bool {
        self.depth.load(Ordering::SeqCst) >= self.max_size
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            depth: self.depth.load(Ordering::SeqCst),
            max_size: self.max_size,
            enqueued: self.enqueued.load(Ordering::SeqCst),
            processing: self.processing.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}
