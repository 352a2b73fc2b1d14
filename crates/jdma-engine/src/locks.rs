//! Per-batch serialization and in-flight task tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jdma_types::{BatchId, RequestId};
use tokio::sync::OwnedMutexGuard;
use tokio::task::AbortHandle;

/// One async mutex per batch, created on first use.
///
/// `advance`, stall handling and compensation all hold the batch's lock from
/// their state read to their state write.
#[derive(Default)]
pub struct BatchLocks {
    locks: Mutex<HashMap<BatchId, Arc<tokio::sync::Mutex<()>>>>,
}

impl BatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `batch_id`.
    pub async fn lock(&self, batch_id: BatchId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("batch locks poisoned");
            // Drop entries nobody is holding or waiting on.
            locks.retain(|id, m| *id == batch_id || Arc::strong_count(m) > 1);
            locks.entry(batch_id).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Whether some task currently holds the lock of `batch_id`.
    pub fn is_locked(&self, batch_id: BatchId) -> bool {
        let locks = self.locks.lock().expect("batch locks poisoned");
        locks
            .get(&batch_id)
            .is_some_and(|m| m.try_lock().is_err())
    }
}

/// Abort handles of worker tasks currently advancing a request.
#[derive(Default)]
pub struct Inflight {
    tasks: Mutex<HashMap<RequestId, AbortHandle>>,
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId, handle: AbortHandle) {
        self.tasks
            .lock()
            .expect("inflight lock poisoned")
            .insert(id, handle);
    }

    pub fn finish(&self, id: RequestId) {
        self.tasks.lock().expect("inflight lock poisoned").remove(&id);
    }

    /// Abort the worker advancing `id`, if any. Returns whether one was found.
    pub fn abort(&self, id: RequestId) -> bool {
        match self.tasks.lock().expect("inflight lock poisoned").remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("inflight lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
