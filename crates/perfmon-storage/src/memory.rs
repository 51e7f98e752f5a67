use crate::error::{Result, SinkError};
use crate::Sink;
use async_trait::async_trait;
use perfmon_common::types::Batch;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Keeps appended batches in memory. Failures can be injected to exercise
/// retry paths.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Batch>>,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    attempts: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_batches(&self) -> MutexGuard<'_, Vec<Batch>> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `n` appends fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every stored batch, in append order.
    pub fn batches(&self) -> Vec<Batch> {
        self.lock_batches().clone()
    }

    /// Number of `append` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, batch: &Batch) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        self.lock_batches().push(batch.clone());
        Ok(())
    }
}
