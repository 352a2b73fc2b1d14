//! Error types for storage backend operations.

use jdma_types::PartHandle;

/// Errors that can occur while talking to a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The handle does not refer to a stored part.
    #[error("part not found: {0}")]
    NotFound(PartHandle),

    /// The backend could not be reached or refused the operation for now.
    ///
    /// This is the only transient variant; [`RetryingBackend`](crate::RetryingBackend)
    /// retries it.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend has reached its capacity limit.
    #[error("backend capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },
}

impl StoreError {
    /// Whether the operation may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::NotFound(_) | Self::CapacityExceeded { .. } => false,
        }
    }
}
