//! Error types for the engine.
//!
//! These are errors returned to callers of the inbound API. Failures that
//! happen while a request is being advanced are not errors; they are recorded
//! on the request as a [`FailureReason`](jdma_types::FailureReason).

use std::path::PathBuf;

use jdma_types::{BackendId, BatchId, BatchStage, RequestId, RequestKind, RequestState};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Failed to access the orchestrator store.
    #[error("metadata error: {0}")]
    Meta(#[from] jdma_meta::MetaError),

    /// Failed to talk to a storage backend.
    #[error("store error: {0}")]
    Store(#[from] jdma_store::StoreError),

    /// Local I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("user {0} already registered")]
    UserExists(String),

    /// The requesting user does not own the batch.
    #[error("user {user} does not own batch {batch}")]
    NotOwner { user: String, batch: BatchId },

    /// Another request on the batch is still in flight.
    #[error("batch {batch} is busy with request {active}")]
    BatchBusy { batch: BatchId, active: RequestId },

    /// The batch is not in a stage that allows this request type.
    #[error("cannot {kind} batch {batch} while it is {stage}")]
    InvalidStage {
        batch: BatchId,
        stage: BatchStage,
        kind: RequestKind,
    },

    #[error("storage backend {0} is not registered")]
    UnknownBackend(BackendId),

    /// A required submission parameter was not supplied.
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),

    /// The GET target's parent directory does not exist.
    #[error("target directory parent does not exist: {}", .0.display())]
    TargetMissing(PathBuf),

    /// The GET file subset matched nothing in the batch.
    #[error("no files in batch {0} match the requested subset")]
    NoMatchingFiles(BatchId),

    /// A batch must contain at least one file.
    #[error("batch has no files")]
    EmptyBatch,

    /// A source path is not absolute or does not exist.
    #[error("invalid source path: {}", .0.display())]
    InvalidSource(PathBuf),

    /// The request is not in `Failed` and cannot be retried.
    #[error("request {id} is {state}; only failed requests can be retried")]
    NotRetryable { id: RequestId, state: RequestState },

    /// The request already finished.
    #[error("request {id} is already {state}")]
    AlreadyTerminal { id: RequestId, state: RequestState },

    /// The workspace does not have enough quota.
    #[error("quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// A new allocation would sit below what is already consumed or reserved.
    #[error("allocation of {requested} bytes is below the {in_use} bytes in use")]
    AllocationBelowUsage { requested: u64, in_use: u64 },
}

impl EngineError {
    /// Collapse a store-level busy/conflict error into the engine's vocabulary.
    pub(crate) fn from_meta(e: jdma_meta::MetaError) -> Self {
        match e {
            jdma_meta::MetaError::BatchBusy { batch, active } => Self::BatchBusy { batch, active },
            jdma_meta::MetaError::BatchNotFound(id) => Self::BatchNotFound(id),
            jdma_meta::MetaError::RequestNotFound(id) => Self::RequestNotFound(id),
            other => Self::Meta(other),
        }
    }
}

/// Error returned by a [`Notifier`](crate::Notifier).
#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);
