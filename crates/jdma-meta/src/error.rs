//! Error types for the orchestrator store.

use jdma_types::{BatchId, RequestId, RequestState};

/// Errors returned by [`MetaStore`](crate::MetaStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// No batch with this id.
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    /// No request with this id.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// A conditional write found the request in a different state.
    #[error("request {id} is {actual}, expected {expected}")]
    StateConflict {
        id: RequestId,
        expected: RequestState,
        actual: RequestState,
    },

    /// The batch already has a non-terminal request.
    #[error("batch {batch} already has active request {active}")]
    BatchBusy { batch: BatchId, active: RequestId },

    /// A stored key did not have the expected layout.
    #[error("malformed key in {keyspace}")]
    MalformedKey { keyspace: &'static str },
}
