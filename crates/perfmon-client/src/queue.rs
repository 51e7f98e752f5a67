use perfmon_common::error::{ErrorKind, PipelineError};
use perfmon_common::types::Batch;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// A batch waiting to be delivered.
#[derive(Debug, Clone)]
pub struct Pending {
    pub batch: Arc<Batch>,
    /// Set once the batch has been put back after a failed delivery.
    pub requeued: bool,
}

impl Pending {
    pub fn new(batch: Batch) -> Self {
        Self {
            batch: Arc::new(batch),
            requeued: false,
        }
    }
}

/// Bounded FIFO between the sampling task and the sender loop.
///
/// When full, the oldest queued batch is evicted to make room, so the most
/// recent samples survive an outage.
pub struct BatchQueue {
    inner: Mutex<VecDeque<Pending>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl BatchQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict_oldest(&self, queue: &mut VecDeque<Pending>) {
        if let Some(evicted) = queue.pop_front() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                sequence = evicted.batch.sequence,
                samples = evicted.batch.len(),
                dropped_total = total,
                kind = %ErrorKind::ResourceExhaustion,
                error = %PipelineError::ResourceExhaustion { dropped: 1 },
                "Queue full, dropped oldest batch"
            );
        }
    }

    /// Enqueues a freshly sampled batch at the back.
    pub fn push(&self, batch: Batch) {
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                self.evict_oldest(&mut queue);
            }
            queue.push_back(Pending::new(batch));
        }
        self.notify.notify_one();
    }

    /// Puts an undelivered batch back at the front so it is retried before
    /// anything sampled after it.
    pub fn requeue_front(&self, pending: Pending) {
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                self.evict_oldest(&mut queue);
            }
            queue.push_front(pending);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Pending> {
        self.lock().pop_front()
    }

    /// Waits until a batch is available. Intended for a single consumer.
    pub async fn next(&self) -> Pending {
        loop {
            if let Some(pending) = self.pop() {
                return pending;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batches evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
