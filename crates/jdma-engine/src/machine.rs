//! The request state machine.
//!
//! [`Orchestrator::advance`] performs the work attached to leaving the
//! request's current state and then moves it one step along its kind's
//! sequence with a write conditioned on the state it read. Failures are
//! written as `Failed` with a [`FailureReason`] and followed by compensation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jdma_pack::{PackError, Unpacker, part_file_name, selects};
use jdma_store::{PartKey, StorageBackend, StoreError};
use jdma_types::events::{RequestFailed, RequestStalled};
use jdma_types::{
    ArchivePart, BackendId, Batch, BatchStage, Claim, Digest, FailureReason, FileEntry, Request,
    RequestId, RequestKind, RequestState, now_millis,
};
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::notifier::Outcome;
use crate::orchestrator::Orchestrator;

/// What one call to [`Orchestrator::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The request moved one step.
    Moved { from: RequestState, to: RequestState },
    /// The stage failed and the request is now `Failed`.
    Failed { reason: FailureReason },
    /// Nothing happened: the request was terminal or not in the observed state.
    Skipped,
}

/// What [`Orchestrator::handle_stall`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    /// First stall: the claim was cleared and the request will be dispatched again.
    Requeued,
    /// Second stall: the request failed with `StageTimeout`.
    TimedOut,
    /// The request had already moved on.
    Ignored,
}

type StageResult = Result<(), FailureReason>;

impl Orchestrator {
    /// Advance a request one step if it is still in `observed`.
    ///
    /// Holds the batch lock from the state read to the state write, so two
    /// calls for requests on the same batch never interleave.
    pub async fn advance(
        &self,
        id: RequestId,
        observed: RequestState,
    ) -> Result<Advance, EngineError> {
        let request = self.load_request(id)?;
        if request.state != observed || request.is_terminal() {
            debug!(request_id = %id, state = %request.state, %observed, "skipping advance");
            return Ok(Advance::Skipped);
        }

        let _guard = self.locks.lock(request.batch_id).await;
        let request = self.load_request(id)?;
        if request.state != observed || request.is_terminal() {
            debug!(request_id = %id, state = %request.state, %observed, "state moved while waiting for batch lock");
            return Ok(Advance::Skipped);
        }

        let Some(next) = request.kind.next_state(observed) else {
            let reason = FailureReason::Internal {
                detail: format!("{observed} is not a {} state", request.kind),
            };
            return self.fail_locked(&request, reason).await;
        };

        match self.run_stage(&request).await {
            Ok(()) => self.commit_transition(&request, next),
            Err(reason) => self.fail_locked(&request, reason).await,
        }
    }

    /// Advance a request until it is terminal. Used by tests and tooling;
    /// the scheduler advances one step per dispatch.
    pub async fn drive(&self, id: RequestId) -> Result<RequestState, EngineError> {
        loop {
            let request = self.load_request(id)?;
            if request.is_terminal() {
                return Ok(request.state);
            }
            self.advance(id, request.state).await?;
        }
    }

    /// Take the dispatch claim on a request.
    ///
    /// Returns `false` if the request left `state` or someone already holds
    /// a claim on it.
    pub fn claim(&self, id: RequestId, state: RequestState, owner: &str) -> Result<bool, EngineError> {
        let now = now_millis();
        match self.meta.try_update_request(id, state, |r| {
            if r.claim.is_some() {
                return false;
            }
            r.claim = Some(Claim {
                owner: owner.to_string(),
                at: now,
            });
            true
        }) {
            Ok(updated) => Ok(updated.is_some()),
            Err(jdma_meta::MetaError::StateConflict { .. }) => Ok(false),
            Err(e) => Err(EngineError::from_meta(e)),
        }
    }

    /// Drop `owner`'s claim on a request still in `state`.
    pub fn release_claim(&self, id: RequestId, state: RequestState, owner: &str) -> Result<(), EngineError> {
        match self.meta.try_update_request(id, state, |r| {
            if r.claim.as_ref().is_some_and(|c| c.owner == owner) {
                r.claim = None;
                true
            } else {
                false
            }
        }) {
            Ok(_) | Err(jdma_meta::MetaError::StateConflict { .. }) => Ok(()),
            Err(e) => Err(EngineError::from_meta(e)),
        }
    }

    /// React to a request that outlived the staleness window in `state`.
    ///
    /// The first stall requeues the request; the second fails it with
    /// `StageTimeout`.
    pub async fn handle_stall(
        &self,
        id: RequestId,
        state: RequestState,
    ) -> Result<StallOutcome, EngineError> {
        let request = self.load_request(id)?;
        let _guard = self.locks.lock(request.batch_id).await;
        let request = self.load_request(id)?;
        if request.state != state || request.is_terminal() {
            return Ok(StallOutcome::Ignored);
        }

        if request.stall_count == 0 {
            match self.meta.transition_request(id, state, |r| {
                r.stall_count += 1;
                r.claim = None;
            }) {
                Ok(_) => {}
                Err(jdma_meta::MetaError::StateConflict { .. }) => return Ok(StallOutcome::Ignored),
                Err(e) => return Err(EngineError::from_meta(e)),
            }
            warn!(request_id = %id, %state, "request stalled, requeued");
            self.events.emit(RequestStalled {
                request_id: id,
                state,
                requeued: true,
            });
            return Ok(StallOutcome::Requeued);
        }

        warn!(request_id = %id, %state, stalls = request.stall_count + 1, "request stalled again");
        self.events.emit(RequestStalled {
            request_id: id,
            state,
            requeued: false,
        });
        match self
            .fail_locked(&request, FailureReason::StageTimeout { state })
            .await?
        {
            Advance::Failed { .. } => Ok(StallOutcome::TimedOut),
            _ => Ok(StallOutcome::Ignored),
        }
    }

    fn commit_transition(
        &self,
        request: &Request,
        next: RequestState,
    ) -> Result<Advance, EngineError> {
        let from = request.state;
        let updated = match self.meta.transition_request(request.id, from, |r| {
            r.state = next;
            r.claim = None;
        }) {
            Ok(updated) => updated,
            Err(jdma_meta::MetaError::StateConflict { actual, .. }) => {
                warn!(request_id = %request.id, %from, %actual, "state changed during stage, dropping result");
                return Ok(Advance::Skipped);
            }
            Err(e) => return Err(EngineError::from_meta(e)),
        };

        info!(request_id = %request.id, kind = %request.kind, %from, to = %next, "request advanced");
        self.emit_changed(&updated, from);
        if next == RequestState::Completed {
            self.notify_terminal(&updated);
        }
        Ok(Advance::Moved { from, to: next })
    }

    /// Write `Failed`, then compensate. The caller holds the batch lock.
    async fn fail_locked(
        &self,
        request: &Request,
        reason: FailureReason,
    ) -> Result<Advance, EngineError> {
        let from = request.state;
        let failed = match self.meta.transition_request(request.id, from, |r| {
            r.state = RequestState::Failed;
            r.failure = Some(reason.clone());
            r.failed_in = Some(from);
            r.claim = None;
        }) {
            Ok(failed) => failed,
            Err(jdma_meta::MetaError::StateConflict { .. }) => return Ok(Advance::Skipped),
            Err(e) => return Err(EngineError::from_meta(e)),
        };

        warn!(
            request_id = %request.id,
            kind = %request.kind,
            state = %from,
            reason = reason.code(),
            detail = %reason,
            "request failed"
        );
        self.emit_failure(&failed, from, reason.clone());
        self.compensate_locked(&failed).await;
        self.notify_terminal(&failed);
        Ok(Advance::Failed { reason })
    }

    pub(crate) fn emit_failure(&self, request: &Request, from: RequestState, reason: FailureReason) {
        self.emit_changed(request, from);
        self.events.emit(RequestFailed {
            request_id: request.id,
            batch_id: request.batch_id,
            state: from,
            reason,
        });
    }

    /// Notify the requester in a detached task, if they asked for it.
    pub(crate) fn notify_terminal(&self, request: &Request) {
        let user = match self.meta.get_user(&request.params.requester) {
            Ok(Some(user)) => user,
            Ok(None) => return,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "cannot load user for notification");
                return;
            }
        };
        let Some(address) = user.email.filter(|_| user.notify) else {
            return;
        };

        let (outcome, detail) = match (&request.failure, request.failed_in) {
            (Some(reason), Some(state)) => (
                Outcome::Failed,
                format!(
                    "{} request {} on batch {} failed in {state}: {reason}",
                    request.kind, request.id, request.batch_id
                ),
            ),
            _ => (
                Outcome::Completed,
                format!(
                    "{} request {} on batch {} completed",
                    request.kind, request.id, request.batch_id
                ),
            ),
        };

        let notifier = self.notifier.clone();
        let id = request.id;
        self.spawn_background(async move {
            if let Err(e) = notifier.notify(&address, id, outcome, &detail).await {
                warn!(request_id = %id, error = %e, "notification failed");
            }
        });
    }

    // ----- Stage work -----

    #[instrument(skip_all, fields(request_id = %request.id, kind = %request.kind, state = %request.state))]
    async fn run_stage(&self, request: &Request) -> StageResult {
        use RequestKind::*;
        use RequestState::*;

        let batch = self.stage_batch(request)?;
        match (request.kind, request.state) {
            (Put | Migrate, Pending) => self.put_pending(request, &batch).await,
            (Put, Packing) => self.put_packing(request, &batch).await,
            (Put, TransferStart) => self.resolve(&batch.backend).map(|_| ()),
            (Put, Transferring) => {
                self.upload_parts(request, &batch, true).await?;
                self.mark_stored(request, &batch)
            }
            (Put, Tidying) => {
                self.remove_staging(request).await;
                Ok(())
            }

            (Get, Pending) => self.get_pending(request, &batch).await,
            (Get, TransferStart) => {
                let staging = self.config.request_staging(batch.id, request.id);
                tokio::fs::create_dir_all(&staging).await.map_err(internal)
            }
            (Get, Restoring) => self.get_restoring(request, &batch).await,
            (Get, Unpacking) => self.get_unpacking(request, &batch).await,
            (Get, Tidying) => {
                self.remove_staging(request).await;
                Ok(())
            }

            (Delete, Pending) => self.set_stage(&batch, BatchStage::Deleting),
            (Delete, DeleteStart) => self.delete_start(&batch).await,
            (Delete, Tidying) => {
                self.delete_tidying(&batch);
                Ok(())
            }

            (Migrate, TransferStart) => {
                self.resolve(&batch.backend)?;
                self.put_packing(request, &batch).await
            }
            (Migrate, Transferring) => self.upload_parts(request, &batch, false).await,
            (Migrate, Verifying) => self.migrate_verifying(request, &batch).await,

            (kind, state) => Err(FailureReason::Internal {
                detail: format!("no work defined for {kind} in {state}"),
            }),
        }
    }

    async fn put_pending(&self, request: &Request, batch: &Batch) -> StageResult {
        for file in &batch.files {
            let path = batch.source_path(&file.path);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(FailureReason::SourceMissing {
                    path: file.path.clone(),
                });
            }
        }
        self.quota
            .reserve(&batch.workspace, &batch.backend, request.id, batch.total_bytes)
            .map_err(|e| match e {
                EngineError::QuotaExceeded {
                    requested,
                    available,
                } => FailureReason::QuotaExceeded {
                    requested,
                    available,
                },
                other => internal(other),
            })?;
        self.set_stage(batch, BatchStage::Putting)
    }

    async fn put_packing(&self, request: &Request, batch: &Batch) -> StageResult {
        // Rows from an earlier attempt are replaced wholesale.
        let stale = self.meta.get_parts(batch.id).map_err(internal)?;
        if !stale.is_empty() {
            if let Ok(backend) = self.resolve(&batch.backend) {
                delete_copies(&backend, stale.iter().filter_map(|p| p.handle.as_ref())).await;
            }
            self.meta.delete_parts(batch.id).map_err(internal)?;
        }
        // Copies left by an earlier stored state are gone now, and so is their claim on quota.
        self.quota
            .reclaim(&batch.workspace, &batch.backend, batch.id)
            .map_err(internal)?;

        let staging = self.config.request_staging(batch.id, request.id);
        let (packed, digests) = self
            .packer
            .pack(batch.id, &batch.root, &batch.files, &staging)
            .await
            .map_err(pack_failure)?;
        for p in &packed {
            self.meta.put_part(&p.part).map_err(internal)?;
        }
        self.meta
            .update_batch(batch.id, |b| {
                for file in &mut b.files {
                    if let Some(digest) = digests.get(&file.path) {
                        file.digest = Some(*digest);
                    }
                }
                b.updated_at = now_millis();
            })
            .map_err(internal)?;
        Ok(())
    }

    /// Upload every part that has no handle yet. With `check`, each copy is
    /// verified against its packed checksum as soon as it is stored.
    async fn upload_parts(&self, request: &Request, batch: &Batch, check: bool) -> StageResult {
        let backend = self.resolve(&batch.backend)?;
        let staging = self.config.request_staging(batch.id, request.id);
        let parts = self.meta.get_parts(batch.id).map_err(internal)?;

        for part in &parts {
            let handle = match &part.handle {
                Some(handle) => handle.clone(),
                None => {
                    let source = staging.join(part_file_name(part.index));
                    let handle = backend
                        .store(&PartKey::new(batch.id, part.index), &source)
                        .await
                        .map_err(|e| store_failure(&batch.backend, e))?;
                    let recorded = handle.clone();
                    self.meta
                        .update_part(batch.id, part.index, |p| p.handle = Some(recorded))
                        .map_err(internal)?;
                    debug!(batch_id = %batch.id, index = part.index, %handle, "uploaded part");
                    handle
                }
            };
            if check {
                check_copy(&backend, &batch.backend, part, &handle).await?;
            }
        }
        Ok(())
    }

    /// Turn the reservation into the batch's consumption and mark it stored.
    ///
    /// Both writes are replayable: the commit is keyed by request, so a
    /// retry after a crash between them counts the bytes once.
    fn mark_stored(&self, request: &Request, batch: &Batch) -> StageResult {
        self.quota
            .commit(&batch.workspace, &batch.backend, request.id, batch.id)
            .map_err(internal)?;
        self.set_stage(batch, BatchStage::OnStorage)
    }

    async fn get_pending(&self, request: &Request, batch: &Batch) -> StageResult {
        if batch.stage != BatchStage::OnStorage {
            return Err(FailureReason::DataUnavailable {
                detail: format!("batch {} is {}", batch.id, batch.stage),
            });
        }
        let target = get_target(request)?;
        let parent = target.parent().unwrap_or(target);
        if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
            return Err(internal(format!(
                "target parent {} does not exist",
                parent.display()
            )));
        }
        Ok(())
    }

    async fn get_restoring(&self, request: &Request, batch: &Batch) -> StageResult {
        let backend = self.resolve(&batch.backend)?;
        let staging = self.config.request_staging(batch.id, request.id);
        tokio::fs::create_dir_all(&staging).await.map_err(internal)?;

        let parts = self.needed_parts(request, batch)?;
        for part in &parts {
            let handle = part
                .handle
                .as_ref()
                .ok_or_else(|| FailureReason::DataUnavailable {
                    detail: format!("part {} of batch {} has no stored copy", part.index, batch.id),
                })?;
            let bytes = backend
                .retrieve(handle, &staging.join(part_file_name(part.index)))
                .await
                .map_err(|e| store_failure(&batch.backend, e))?;
            debug!(batch_id = %batch.id, index = part.index, bytes, "retrieved part");
        }

        if self.config.verify_before_unpack {
            Unpacker::new(true)
                .verify_all(&staged(&parts, &staging))
                .await
                .map_err(pack_failure)?;
        }
        Ok(())
    }

    async fn get_unpacking(&self, request: &Request, batch: &Batch) -> StageResult {
        let target = get_target(request)?;
        tokio::fs::create_dir_all(target).await.map_err(internal)?;
        let staging = self.config.request_staging(batch.id, request.id);
        let parts = self.needed_parts(request, batch)?;

        // Parts were already checked in RESTORING when verification is on;
        // otherwise they are checked here, before the scratch tree is moved.
        let restored = Unpacker::new(!self.config.verify_before_unpack)
            .unpack(
                &staged(&parts, &staging),
                target,
                &request.params.files,
                &request.id.to_string(),
            )
            .await
            .map_err(pack_failure)?;
        info!(request_id = %request.id, batch_id = %batch.id, files = restored.len(), target = %target.display(), "restored files");
        Ok(())
    }

    async fn delete_start(&self, batch: &Batch) -> StageResult {
        let backend = self.resolve(&batch.backend)?;
        for part in self.meta.get_parts(batch.id).map_err(internal)? {
            let Some(handle) = &part.handle else {
                continue;
            };
            backend
                .delete(handle)
                .await
                .map_err(|e| store_failure(&batch.backend, e))?;
            self.meta
                .update_part(batch.id, part.index, |p| p.handle = None)
                .map_err(internal)?;
            debug!(batch_id = %batch.id, index = part.index, %handle, "deleted part");
        }
        Ok(())
    }

    fn delete_tidying(&self, batch: &Batch) {
        if let Err(e) = self.meta.delete_parts(batch.id) {
            warn!(batch_id = %batch.id, error = %e, "failed to drop part rows");
        }
        match self.quota.reclaim(&batch.workspace, &batch.backend, batch.id) {
            Ok(bytes) => debug!(batch_id = %batch.id, bytes, "reclaimed batch quota"),
            Err(e) => warn!(batch_id = %batch.id, error = %e, "failed to reclaim quota"),
        }
        if let Err(e) = self.set_stage(batch, BatchStage::Deleted) {
            warn!(batch_id = %batch.id, error = %e, "failed to mark batch deleted");
        }
    }

    /// Verify every stored copy, commit the batch, then remove its sources.
    ///
    /// Sources are only touched once the commit and the stage write are
    /// durable, so a crash part-way leaves either the sources or a stored
    /// batch, never neither.
    async fn migrate_verifying(&self, request: &Request, batch: &Batch) -> StageResult {
        let backend = self.resolve(&batch.backend)?;
        let parts = self.meta.get_parts(batch.id).map_err(internal)?;
        for part in &parts {
            let handle = part
                .handle
                .as_ref()
                .ok_or_else(|| FailureReason::DataUnavailable {
                    detail: format!("part {} of batch {} has no stored copy", part.index, batch.id),
                })?;
            check_copy(&backend, &batch.backend, part, handle).await?;
        }
        self.mark_stored(request, batch)?;
        self.remove_staging(request).await;

        let stored = self.load_batch(batch.id).map_err(internal)?;
        let (removed, kept) = tokio::task::spawn_blocking(move || remove_sources(&stored))
            .await
            .map_err(internal)?;
        info!(request_id = %request.id, batch_id = %batch.id, removed, kept, "batch migrated, sources removed");
        Ok(())
    }

    // ----- Compensation -----

    /// Undo the side effects of a failed request. Safe to run more than once.
    pub(crate) async fn compensate_locked(&self, request: &Request) {
        let batch = match self.load_batch(request.batch_id) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "cannot compensate, batch unreadable");
                return;
            }
        };

        match request.kind {
            RequestKind::Put | RequestKind::Migrate => {
                if let Err(e) = self.quota.release(&batch.workspace, &batch.backend, request.id) {
                    warn!(request_id = %request.id, error = %e, "failed to release reservation");
                }
                if batch.stage == BatchStage::OnStorage {
                    // Every copy was verified and committed; only the tail failed.
                    self.remove_staging(request).await;
                    debug!(request_id = %request.id, batch_id = %batch.id, "batch already stored, keeping it");
                    return;
                }
                if let Err(e) = self.quota.reclaim(&batch.workspace, &batch.backend, batch.id) {
                    warn!(batch_id = %batch.id, error = %e, "failed to reclaim quota");
                }
                match self.meta.get_parts(batch.id) {
                    Ok(parts) => {
                        if let Ok(backend) = self.resolve(&batch.backend) {
                            delete_copies(&backend, parts.iter().filter_map(|p| p.handle.as_ref())).await;
                        }
                        if let Err(e) = self.meta.delete_parts(batch.id) {
                            warn!(batch_id = %batch.id, error = %e, "failed to drop part rows");
                        }
                    }
                    Err(e) => warn!(batch_id = %batch.id, error = %e, "failed to read parts"),
                }
                self.remove_staging(request).await;
                if let Err(e) = self.set_stage(&batch, BatchStage::Failed) {
                    warn!(batch_id = %batch.id, error = %e, "failed to mark batch failed");
                }
            }
            RequestKind::Get => {
                self.remove_staging(request).await;
                if let Some(target) = &request.params.target_path {
                    let scratch = Unpacker::scratch_dir(target, &request.id.to_string());
                    remove_dir(&scratch).await;
                }
            }
            RequestKind::Delete => {
                let intact = match self.meta.get_parts(batch.id) {
                    Ok(parts) => parts.iter().all(|p| p.handle.is_some()),
                    Err(e) => {
                        warn!(batch_id = %batch.id, error = %e, "failed to read parts");
                        false
                    }
                };
                let stage = if intact {
                    BatchStage::OnStorage
                } else {
                    BatchStage::Failed
                };
                if let Err(e) = self.set_stage(&batch, stage) {
                    warn!(batch_id = %batch.id, error = %e, "failed to restore batch stage");
                }
            }
        }
        debug!(request_id = %request.id, kind = %request.kind, "compensation finished");
    }

    // ----- Helpers -----

    fn stage_batch(&self, request: &Request) -> Result<Batch, FailureReason> {
        self.meta
            .get_batch(request.batch_id)
            .map_err(internal)?
            .ok_or_else(|| internal(format!("batch {} not found", request.batch_id)))
    }

    fn resolve(&self, id: &BackendId) -> Result<Arc<dyn StorageBackend>, FailureReason> {
        self.registry
            .get(id)
            .map(|e| e.backend.clone())
            .ok_or_else(|| FailureReason::BackendUnavailable {
                backend: id.to_string(),
                detail: "not registered".to_string(),
            })
    }

    fn set_stage(&self, batch: &Batch, stage: BatchStage) -> StageResult {
        self.meta
            .update_batch(batch.id, |b| {
                b.stage = stage;
                b.updated_at = now_millis();
            })
            .map_err(internal)?;
        debug!(batch_id = %batch.id, %stage, "batch stage changed");
        Ok(())
    }

    fn needed_parts(&self, request: &Request, batch: &Batch) -> Result<Vec<ArchivePart>, FailureReason> {
        let subset = &request.params.files;
        Ok(self
            .meta
            .get_parts(batch.id)
            .map_err(internal)?
            .into_iter()
            .filter(|p| p.files.iter().any(|f| selects(subset, f)))
            .collect())
    }

    async fn remove_staging(&self, request: &Request) {
        remove_dir(&self.config.request_staging(request.batch_id, request.id)).await;
    }
}

/// Ask the backend for the digest of a stored copy and compare it with the
/// checksum recorded at packing time.
async fn check_copy(
    backend: &Arc<dyn StorageBackend>,
    backend_id: &BackendId,
    part: &ArchivePart,
    handle: &jdma_types::PartHandle,
) -> StageResult {
    let actual = backend
        .verify(handle)
        .await
        .map_err(|e| store_failure(backend_id, e))?;
    if actual != part.checksum {
        return Err(FailureReason::CorruptData {
            part: part.index,
            expected: part.checksum,
            actual,
        });
    }
    Ok(())
}

async fn delete_copies<'a>(
    backend: &Arc<dyn StorageBackend>,
    handles: impl Iterator<Item = &'a jdma_types::PartHandle>,
) {
    for handle in handles {
        if let Err(e) = backend.delete(handle).await {
            warn!(%handle, error = %e, "failed to delete stored copy");
        }
    }
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "removed directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove directory"),
    }
}

fn staged(parts: &[ArchivePart], staging: &Path) -> Vec<(ArchivePart, PathBuf)> {
    parts
        .iter()
        .map(|p| (p.clone(), staging.join(part_file_name(p.index))))
        .collect()
}

fn get_target(request: &Request) -> Result<&Path, FailureReason> {
    request
        .params
        .target_path
        .as_deref()
        .ok_or_else(|| internal("GET request has no target path"))
}

/// Remove a stored batch's source files, then any directories under its root
/// left empty. A file whose size or digest no longer matches what was packed
/// is kept. Returns `(removed, kept)`. Blocking.
fn remove_sources(batch: &Batch) -> (usize, usize) {
    let (mut removed, mut kept) = (0, 0);
    let mut dirs = BTreeSet::new();
    for file in &batch.files {
        let path = batch.source_path(&file.path);
        match source_unchanged(&path, file) {
            Ok(true) => {}
            Ok(false) => {
                warn!(path = %path.display(), "source changed since packing, keeping it");
                kept += 1;
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot check source, keeping it");
                kept += 1;
                continue;
            }
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove source");
                kept += 1;
            }
        }
        let mut dir = path.parent();
        while let Some(d) = dir.filter(|d| *d != batch.root.as_path() && d.starts_with(&batch.root)) {
            dirs.insert(d.to_path_buf());
            dir = d.parent();
        }
    }
    // Deepest first; a directory that still holds anything stays.
    for dir in dirs.iter().rev() {
        let _ = std::fs::remove_dir(dir);
    }
    (removed, kept)
}

fn source_unchanged(path: &Path, file: &FileEntry) -> std::io::Result<bool> {
    if std::fs::metadata(path)?.len() != file.size {
        return Ok(false);
    }
    match file.digest {
        Some(digest) => Ok(Digest::of_file(path)? == digest),
        None => Ok(false),
    }
}

fn internal(e: impl std::fmt::Display) -> FailureReason {
    FailureReason::Internal {
        detail: e.to_string(),
    }
}

fn store_failure(backend: &BackendId, e: StoreError) -> FailureReason {
    match e {
        StoreError::NotFound(handle) => FailureReason::DataUnavailable {
            detail: format!("{handle} missing on {backend}"),
        },
        other => FailureReason::BackendUnavailable {
            backend: backend.to_string(),
            detail: other.to_string(),
        },
    }
}

fn pack_failure(e: PackError) -> FailureReason {
    match e {
        PackError::SourceMissing { path } => FailureReason::SourceMissing { path },
        PackError::ChecksumMismatch {
            part,
            expected,
            actual,
        } => FailureReason::CorruptData {
            part,
            expected,
            actual,
        },
        other => internal(other),
    }
}
