//! The orchestrator: inbound API over batches, requests and users.
//!
//! The state machine itself lives in `machine.rs`; this file holds the
//! constructor, submission validation and the read-side queries.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use jdma_meta::MetaStore;
use jdma_pack::{Packer, selects};
use jdma_store::BackendRegistry;
use jdma_types::events::{EventBus, RequestSubmitted, StateChanged};
use jdma_types::{
    ArchivePart, BackendId, BackendKind, Batch, BatchId, BatchStage, FailureReason, FileEntry,
    OrchestratorConfig, Request, RequestId, RequestKind, RequestParams, RequestState,
    RequestStatus, User, now_millis, relative_path,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::locks::{BatchLocks, Inflight};
use crate::notifier::Notifier;
use crate::quota::QuotaLedger;

/// Input to [`Orchestrator::register_batch`].
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub owner: String,
    pub workspace: String,
    pub backend: BackendId,
    /// Absolute paths of files or directories. Directories are walked.
    pub paths: Vec<PathBuf>,
    pub label: Option<String>,
}

/// Filter for [`Orchestrator::list_requests`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub batch_id: Option<BatchId>,
    pub requester: Option<String>,
    pub state: Option<RequestState>,
    pub kind: Option<RequestKind>,
    /// Only requests that have not reached a terminal state.
    pub active_only: bool,
}

impl RequestFilter {
    pub fn matches(&self, request: &Request) -> bool {
        self.batch_id.is_none_or(|b| request.batch_id == b)
            && self
                .requester
                .as_deref()
                .is_none_or(|u| request.params.requester == u)
            && self.state.is_none_or(|s| request.state == s)
            && self.kind.is_none_or(|k| request.kind == k)
            && (!self.active_only || !request.is_terminal())
    }
}

/// A registered backend as reported by [`Orchestrator::backends`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub id: BackendId,
    pub kind: BackendKind,
    pub concurrency: usize,
}

/// Drives batches and their requests through the transfer lifecycle.
///
/// Cheap to clone; every clone shares the same store, registry and locks.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) registry: Arc<BackendRegistry>,
    pub(crate) quota: QuotaLedger,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) packer: Arc<Packer>,
    pub(crate) locks: Arc<BatchLocks>,
    pub(crate) inflight: Arc<Inflight>,
    pub(crate) events: EventBus,
    pub(crate) config: Arc<OrchestratorConfig>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Orchestrator {
    pub fn new(
        meta: Arc<MetaStore>,
        registry: BackendRegistry,
        notifier: Arc<dyn Notifier>,
        config: OrchestratorConfig,
    ) -> Self {
        info!(
            backends = registry.len(),
            staging = %config.staging_dir.display(),
            part_ceiling = config.part_ceiling,
            verify_before_unpack = config.verify_before_unpack,
            "orchestrator ready"
        );
        Self {
            quota: QuotaLedger::new(meta.clone()),
            packer: Arc::new(Packer::new(config.part_ceiling)),
            meta,
            registry: Arc::new(registry),
            notifier,
            locks: Arc::new(BatchLocks::new()),
            inflight: Arc::new(Inflight::new()),
            events: EventBus::new(),
            config: Arc::new(config),
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn inflight(&self) -> &Inflight {
        &self.inflight
    }

    // ----- Batches -----

    /// Record a new batch in `OnDisk`.
    ///
    /// Directories are walked recursively in name order. The batch root is
    /// the deepest directory containing every file.
    pub async fn register_batch(&self, new: NewBatch) -> Result<BatchId, EngineError> {
        if !self.registry.contains(&new.backend) {
            return Err(EngineError::UnknownBackend(new.backend));
        }
        let paths = new.paths.clone();
        let found = tokio::task::spawn_blocking(move || collect_files(&paths))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;
        if found.is_empty() {
            return Err(EngineError::EmptyBatch);
        }

        let root = common_root(found.iter().map(|(p, _)| p.as_path()));
        let mut files = Vec::with_capacity(found.len());
        for (path, size) in &found {
            let rel = relative_path(&root, path).ok_or_else(|| EngineError::InvalidSource(path.clone()))?;
            files.push(FileEntry {
                path: rel,
                size: *size,
                digest: None,
            });
        }
        let total_bytes = files.iter().map(|f| f.size).sum();

        let id = self.meta.allocate_batch_id()?;
        let now = now_millis();
        let batch = Batch {
            id,
            label: new.label.unwrap_or_else(|| format!("batch-{id}")),
            owner: new.owner,
            workspace: new.workspace,
            backend: new.backend,
            root,
            files,
            total_bytes,
            stage: BatchStage::OnDisk,
            created_at: now,
            updated_at: now,
        };
        self.meta.put_batch(&batch)?;
        info!(
            batch_id = %id,
            owner = %batch.owner,
            workspace = %batch.workspace,
            backend = %batch.backend,
            files = batch.files.len(),
            total_bytes,
            "registered batch"
        );
        Ok(id)
    }

    /// Change a batch's label. Only the owner may do this.
    pub fn set_batch_label(
        &self,
        batch_id: BatchId,
        requester: &str,
        label: &str,
    ) -> Result<Batch, EngineError> {
        let batch = self.load_batch(batch_id)?;
        if batch.owner != requester {
            return Err(EngineError::NotOwner {
                user: requester.to_string(),
                batch: batch_id,
            });
        }
        let label = label.to_string();
        let batch = self
            .meta
            .update_batch(batch_id, |b| {
                b.label = label;
                b.updated_at = now_millis();
            })
            .map_err(EngineError::from_meta)?;
        debug!(%batch_id, label = %batch.label, "relabelled batch");
        Ok(batch)
    }

    pub fn get_batch(&self, batch_id: BatchId) -> Result<Batch, EngineError> {
        self.load_batch(batch_id)
    }

    /// Batches, optionally restricted to an owner and/or workspace.
    pub fn list_batches(
        &self,
        owner: Option<&str>,
        workspace: Option<&str>,
    ) -> Result<Vec<Batch>, EngineError> {
        Ok(self
            .meta
            .list_batches()?
            .into_iter()
            .filter(|b| owner.is_none_or(|o| b.owner == o))
            .filter(|b| workspace.is_none_or(|w| b.workspace == w))
            .collect())
    }

    pub fn list_files(&self, batch_id: BatchId) -> Result<Vec<FileEntry>, EngineError> {
        Ok(self.load_batch(batch_id)?.files)
    }

    pub fn list_parts(&self, batch_id: BatchId) -> Result<Vec<ArchivePart>, EngineError> {
        self.load_batch(batch_id)?;
        Ok(self.meta.get_parts(batch_id)?)
    }

    // ----- Requests -----

    /// Validate and persist a new request in `Pending`.
    ///
    /// Rejected synchronously if the requester does not own the batch, the
    /// batch stage does not allow `kind`, a parameter is missing or invalid,
    /// or another request on the batch is still active.
    pub async fn submit_request(
        &self,
        batch_id: BatchId,
        kind: RequestKind,
        params: RequestParams,
    ) -> Result<RequestId, EngineError> {
        let batch = self.load_batch(batch_id)?;
        self.validate_submission(&batch, kind, &params).await?;

        if let Some(active) = self.meta.active_request_for(batch_id)? {
            return Err(EngineError::BatchBusy {
                batch: batch_id,
                active,
            });
        }

        let id = self.meta.allocate_request_id()?;
        let request = Request::new(id, batch_id, kind, params, now_millis());
        self.meta
            .insert_request(&request)
            .map_err(EngineError::from_meta)?;

        info!(request_id = %id, %batch_id, %kind, requester = %request.params.requester, "request submitted");
        self.events.emit(RequestSubmitted {
            request_id: id,
            batch_id,
            kind,
        });
        Ok(id)
    }

    async fn validate_submission(
        &self,
        batch: &Batch,
        kind: RequestKind,
        params: &RequestParams,
    ) -> Result<(), EngineError> {
        if batch.owner != params.requester {
            return Err(EngineError::NotOwner {
                user: params.requester.clone(),
                batch: batch.id,
            });
        }

        let allowed: &[BatchStage] = match kind {
            RequestKind::Put | RequestKind::Migrate => &[BatchStage::OnDisk, BatchStage::Failed],
            RequestKind::Get => &[BatchStage::OnStorage],
            RequestKind::Delete => &[BatchStage::OnStorage, BatchStage::Failed],
        };
        if !allowed.contains(&batch.stage) {
            return Err(EngineError::InvalidStage {
                batch: batch.id,
                stage: batch.stage,
                kind,
            });
        }

        match kind {
            RequestKind::Put | RequestKind::Migrate => {
                if !self.registry.contains(&batch.backend) {
                    return Err(EngineError::UnknownBackend(batch.backend.clone()));
                }
            }
            RequestKind::Get => {
                let target = params
                    .target_path
                    .as_ref()
                    .ok_or(EngineError::MissingParam("target_path"))?;
                let parent = target.parent().unwrap_or(target.as_path());
                if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                    return Err(EngineError::TargetMissing(target.clone()));
                }
                if !batch.files.iter().any(|f| selects(&params.files, &f.path)) {
                    return Err(EngineError::NoMatchingFiles(batch.id));
                }
            }
            RequestKind::Delete => {}
        }
        Ok(())
    }

    /// The last durable state of a request.
    pub fn get_request_status(&self, id: RequestId) -> Result<RequestStatus, EngineError> {
        Ok(self.load_request(id)?.status())
    }

    pub fn get_request(&self, id: RequestId) -> Result<Request, EngineError> {
        self.load_request(id)
    }

    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, EngineError> {
        let requests = match filter.state {
            Some(state) => self.meta.requests_in_state(state)?,
            None => self.meta.list_requests()?,
        };
        let mut out: Vec<Request> = requests.into_iter().filter(|r| filter.matches(r)).collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    /// Fail a request with `Cancelled`.
    ///
    /// The state write happens before this returns. The in-flight worker, if
    /// any, is aborted and compensation runs afterwards in a background task.
    pub async fn cancel_request(&self, id: RequestId) -> Result<RequestStatus, EngineError> {
        let (cancelled, from) = loop {
            let request = self.load_request(id)?;
            if request.is_terminal() {
                return Err(EngineError::AlreadyTerminal {
                    id,
                    state: request.state,
                });
            }
            let from = request.state;
            match self.meta.transition_request(id, from, |r| {
                r.state = RequestState::Failed;
                r.failure = Some(FailureReason::Cancelled);
                r.failed_in = Some(from);
                r.claim = None;
            }) {
                Ok(updated) => break (updated, from),
                Err(jdma_meta::MetaError::StateConflict { .. }) => continue,
                Err(e) => return Err(EngineError::from_meta(e)),
            }
        };

        let aborted = self.inflight.abort(id);
        info!(request_id = %id, kind = %cancelled.kind, %from, aborted, "request cancelled");
        self.emit_failure(&cancelled, from, FailureReason::Cancelled);

        let this = self.clone();
        let request = cancelled.clone();
        self.spawn_background(async move {
            let _guard = this.locks.lock(request.batch_id).await;
            this.compensate_locked(&request).await;
            this.notify_terminal(&request);
        });
        Ok(cancelled.status())
    }

    /// Resubmit a failed request as a new `Pending` request.
    pub async fn retry_request(&self, id: RequestId) -> Result<RequestId, EngineError> {
        let failed = self.load_request(id)?;
        if failed.state != RequestState::Failed {
            return Err(EngineError::NotRetryable {
                id,
                state: failed.state,
            });
        }
        let batch = self.load_batch(failed.batch_id)?;
        self.validate_submission(&batch, failed.kind, &failed.params)
            .await?;

        let new_id = self.meta.allocate_request_id()?;
        let mut request = Request::new(
            new_id,
            failed.batch_id,
            failed.kind,
            failed.params.clone(),
            now_millis(),
        );
        request.retry_of = Some(id);
        self.meta
            .insert_request(&request)
            .map_err(EngineError::from_meta)?;

        info!(request_id = %new_id, retry_of = %id, kind = %request.kind, "request retried");
        self.events.emit(RequestSubmitted {
            request_id: new_id,
            batch_id: request.batch_id,
            kind: request.kind,
        });
        Ok(new_id)
    }

    // ----- Users -----

    pub fn register_user(&self, user: User) -> Result<(), EngineError> {
        if self.meta.get_user(&user.name)?.is_some() {
            return Err(EngineError::UserExists(user.name));
        }
        self.meta.put_user(&user)?;
        info!(user = %user.name, notify = user.notify, "registered user");
        Ok(())
    }

    pub fn update_user(&self, user: User) -> Result<(), EngineError> {
        if self.meta.get_user(&user.name)?.is_none() {
            return Err(EngineError::UserNotFound(user.name));
        }
        self.meta.put_user(&user)?;
        debug!(user = %user.name, "updated user");
        Ok(())
    }

    pub fn get_user(&self, name: &str) -> Result<User, EngineError> {
        self.meta
            .get_user(name)?
            .ok_or_else(|| EngineError::UserNotFound(name.to_string()))
    }

    // ----- Backends -----

    pub fn backends(&self) -> Vec<BackendInfo> {
        self.registry
            .entries()
            .map(|e| BackendInfo {
                id: e.id.clone(),
                kind: e.kind,
                concurrency: e.concurrency,
            })
            .collect()
    }

    // ----- Background work -----

    /// Run `fut` detached, tracked so [`Orchestrator::wait_background`] can
    /// join it.
    pub(crate) fn spawn_background<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.background.lock().expect("background lock poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Wait for detached compensation and notification tasks to finish.
    pub async fn wait_background(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.background.lock().expect("background lock poisoned"));
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "background task failed");
                }
            }
        }
    }

    // ----- Helpers -----

    pub(crate) fn load_batch(&self, id: BatchId) -> Result<Batch, EngineError> {
        self.meta
            .get_batch(id)?
            .ok_or(EngineError::BatchNotFound(id))
    }

    pub(crate) fn load_request(&self, id: RequestId) -> Result<Request, EngineError> {
        self.meta
            .get_request(id)?
            .ok_or(EngineError::RequestNotFound(id))
    }

    pub(crate) fn emit_changed(&self, request: &Request, from: RequestState) {
        self.events.emit(StateChanged {
            request_id: request.id,
            batch_id: request.batch_id,
            kind: request.kind,
            from,
            to: request.state,
        });
    }
}

/// Expand files and directories into `(path, size)` pairs, keeping the
/// submitted order and dropping duplicates.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<(PathBuf, u64)>, EngineError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for path in paths {
        if !path.is_absolute() {
            return Err(EngineError::InvalidSource(path.clone()));
        }
        let meta = std::fs::metadata(path).map_err(|_| EngineError::InvalidSource(path.clone()))?;
        if meta.is_dir() {
            walk(path, &mut out, &mut seen)?;
        } else if meta.is_file() {
            if seen.insert(path.clone()) {
                out.push((path.clone(), meta.len()));
            }
        } else {
            return Err(EngineError::InvalidSource(path.clone()));
        }
    }
    Ok(out)
}

fn walk(
    dir: &Path,
    out: &mut Vec<(PathBuf, u64)>,
    seen: &mut HashSet<PathBuf>,
) -> Result<(), EngineError> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&path, out, seen)?;
        } else if file_type.is_file() && seen.insert(path.clone()) {
            let size = entry.metadata()?.len();
            out.push((path, size));
        }
    }
    Ok(())
}

/// Deepest directory that contains every path.
fn common_root<'a>(mut paths: impl Iterator<Item = &'a Path>) -> PathBuf {
    let Some(first) = paths.next() else {
        return PathBuf::from("/");
    };
    let mut root = first.parent().map(Path::to_path_buf).unwrap_or_default();
    for path in paths {
        while !path.starts_with(&root) {
            if !root.pop() {
                break;
            }
        }
    }
    root
}
