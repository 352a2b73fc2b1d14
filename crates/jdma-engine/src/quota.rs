//! Per-(workspace, backend) capacity accounting.
//!
//! Reservations are keyed by the request that holds them and committed bytes
//! by the batch they were committed for, so `reserve`, `commit`, `release`
//! and `reclaim` can be replayed after a crash without double counting, and
//! a batch only ever gives back what it took. Every operation is a single
//! atomic read-modify-write of one record in the orchestrator store.

use std::sync::Arc;

use jdma_meta::MetaStore;
use jdma_types::{BackendId, BatchId, QuotaRecord, RequestId};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Quota ledger over the `quota` keyspace.
#[derive(Clone)]
pub struct QuotaLedger {
    meta: Arc<MetaStore>,
}

impl QuotaLedger {
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Hold `bytes` for `request` against the workspace's allocation.
    ///
    /// Idempotent: a request that already holds a reservation keeps it.
    pub fn reserve(
        &self,
        workspace: &str,
        backend: &BackendId,
        request: RequestId,
        bytes: u64,
    ) -> Result<(), EngineError> {
        self.meta.modify_quota(workspace, backend, |record| {
            if record.reservations.contains_key(&request) {
                return Ok(());
            }
            let available = record.available();
            if bytes > available {
                return Err(EngineError::QuotaExceeded {
                    requested: bytes,
                    available,
                });
            }
            record.reservations.insert(request, bytes);
            debug!(workspace, %backend, %request, bytes, "reserved quota");
            Ok(())
        })
    }

    /// Turn the request's reservation into bytes consumed by `batch`.
    /// No-op without one.
    pub fn commit(
        &self,
        workspace: &str,
        backend: &BackendId,
        request: RequestId,
        batch: BatchId,
    ) -> Result<(), EngineError> {
        self.meta.modify_quota(workspace, backend, |record| {
            if let Some(bytes) = record.reservations.remove(&request) {
                *record.stored.entry(batch).or_default() += bytes;
                record.consumed = record.consumed.saturating_add(bytes);
                debug!(workspace, %backend, %request, %batch, bytes, consumed = record.consumed, "committed quota");
            }
            Ok::<_, EngineError>(())
        })
    }

    /// Drop the request's reservation. No-op without one.
    pub fn release(
        &self,
        workspace: &str,
        backend: &BackendId,
        request: RequestId,
    ) -> Result<(), EngineError> {
        self.meta.modify_quota(workspace, backend, |record| {
            if let Some(bytes) = record.reservations.remove(&request) {
                debug!(workspace, %backend, %request, bytes, "released quota");
            }
            Ok::<_, EngineError>(())
        })
    }

    /// Give back whatever was committed for `batch` after its data left the
    /// backend. Returns the bytes reclaimed; zero if nothing was committed.
    pub fn reclaim(
        &self,
        workspace: &str,
        backend: &BackendId,
        batch: BatchId,
    ) -> Result<u64, EngineError> {
        self.meta.modify_quota(workspace, backend, |record| {
            let Some(bytes) = record.stored.remove(&batch) else {
                return Ok(0);
            };
            if bytes > record.consumed {
                warn!(workspace, %backend, %batch, bytes, consumed = record.consumed, "reclaiming more than consumed");
            }
            record.consumed = record.consumed.saturating_sub(bytes);
            debug!(workspace, %backend, %batch, bytes, consumed = record.consumed, "reclaimed quota");
            Ok::<_, EngineError>(bytes)
        })
    }

    /// Set the capacity ceiling for a workspace on a backend.
    ///
    /// Fails with [`EngineError::AllocationBelowUsage`] if the ceiling would
    /// sit below the bytes already consumed plus those reserved.
    pub fn set_allocation(
        &self,
        workspace: &str,
        backend: &BackendId,
        bytes: u64,
    ) -> Result<QuotaRecord, EngineError> {
        let record = self.meta.modify_quota(workspace, backend, |record| {
            let in_use = record.in_use();
            if bytes < in_use {
                return Err(EngineError::AllocationBelowUsage {
                    requested: bytes,
                    in_use,
                });
            }
            record.allocated = bytes;
            Ok(record.clone())
        })?;
        info!(workspace, %backend, allocated = bytes, "set quota allocation");
        Ok(record)
    }

    /// Current record; a workspace with no record has zero allocation.
    pub fn usage(&self, workspace: &str, backend: &BackendId) -> Result<QuotaRecord, EngineError> {
        Ok(self
            .meta
            .get_quota(workspace, backend)?
            .unwrap_or_else(|| QuotaRecord::new(workspace, backend.clone(), 0)))
    }

    /// Every record in the ledger.
    pub fn all(&self) -> Result<Vec<QuotaRecord>, EngineError> {
        Ok(self.meta.list_quotas()?)
    }
}
