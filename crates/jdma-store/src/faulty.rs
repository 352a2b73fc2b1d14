//! A [`StorageBackend`] wrapper that injects scripted faults.
//!
//! Faults are queued per operation and consumed one per call, so a test can
//! say "the next two uploads fail with `Unavailable`, then succeed". Handles
//! can also be marked corrupt, which persists until cleared.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use jdma_types::{BackendKind, Digest, PartHandle};
use tracing::debug;

use crate::backend::{PartKey, StorageBackend};
use crate::error::StoreError;

/// Backend operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Store,
    Retrieve,
    Delete,
    Verify,
}

/// What happens to a faulted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with the transient [`StoreError::Unavailable`].
    Unavailable,
    /// Fail with [`StoreError::NotFound`].
    NotFound,
    /// Never return.
    Hang,
}

#[derive(Default)]
struct Script {
    queued: HashMap<Op, VecDeque<Fault>>,
    corrupt: HashSet<PartHandle>,
    calls: HashMap<Op, usize>,
}

/// Wraps a backend and misbehaves on request.
pub struct FaultyBackend {
    inner: Arc<dyn StorageBackend>,
    script: Mutex<Script>,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            script: Mutex::new(Script::default()),
        }
    }

    /// Make the next `times` calls of `op` fail with `fault`.
    pub fn fail_next(&self, op: Op, fault: Fault, times: usize) {
        let mut script = self.script.lock().expect("script lock poisoned");
        let queue = script.queued.entry(op).or_default();
        queue.extend(std::iter::repeat_n(fault, times));
    }

    /// Serve damaged bytes for `handle` on every retrieve and verify.
    pub fn corrupt(&self, handle: &PartHandle) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .corrupt
            .insert(handle.clone());
    }

    /// Drop all queued faults and corruption marks.
    pub fn heal(&self) {
        let mut script = self.script.lock().expect("script lock poisoned");
        script.queued.clear();
        script.corrupt.clear();
    }

    /// How many times `op` has been called, faulted or not.
    pub fn calls(&self, op: Op) -> usize {
        self.script
            .lock()
            .expect("script lock poisoned")
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    async fn check(&self, op: Op, handle: Option<&PartHandle>) -> Result<(), StoreError> {
        let fault = {
            let mut script = self.script.lock().expect("script lock poisoned");
            *script.calls.entry(op).or_default() += 1;
            script.queued.get_mut(&op).and_then(|q| q.pop_front())
        };
        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => {
                debug!(?op, "injected unavailable");
                Err(StoreError::Unavailable(format!("injected fault on {op:?}")))
            }
            Some(Fault::NotFound) => {
                debug!(?op, "injected not found");
                Err(StoreError::NotFound(
                    handle.cloned().unwrap_or_else(|| PartHandle::from("<new>")),
                ))
            }
            Some(Fault::Hang) => {
                debug!(?op, "injected hang");
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn is_corrupt(&self, handle: &PartHandle) -> bool {
        self.script
            .lock()
            .expect("script lock poisoned")
            .corrupt
            .contains(handle)
    }
}

#[async_trait::async_trait]
impl StorageBackend for FaultyBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError> {
        self.check(Op::Store, None).await?;
        self.inner.store(key, source).await
    }

    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError> {
        self.check(Op::Retrieve, Some(handle)).await?;
        let n = self.inner.retrieve(handle, target).await?;
        if self.is_corrupt(handle) {
            let mut data = tokio::fs::read(target).await?;
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            } else {
                data.push(0xff);
            }
            tokio::fs::write(target, &data).await?;
            return Ok(data.len() as u64);
        }
        Ok(n)
    }

    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError> {
        self.check(Op::Delete, Some(handle)).await?;
        self.inner.delete(handle).await
    }

    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError> {
        self.check(Op::Verify, Some(handle)).await?;
        let digest = self.inner.verify(handle).await?;
        if self.is_corrupt(handle) {
            let mut bytes = *digest.as_bytes();
            bytes[0] ^= 0xff;
            return Ok(Digest::from(bytes));
        }
        Ok(digest)
    }
}
