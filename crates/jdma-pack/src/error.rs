//! Error types for packing and unpacking.

use jdma_types::Digest;

/// Errors that can occur while packing, verifying or unpacking parts.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    /// A source file registered with the batch no longer exists.
    #[error("source file missing: {path}")]
    SourceMissing {
        /// Path relative to the batch root.
        path: String,
    },

    /// An archive member would be written outside the target directory.
    #[error("unsafe member path in archive: {path}")]
    UnsafePath {
        /// The offending member path.
        path: String,
    },

    /// A restored file would replace something already in the target.
    #[error("restore target already exists: {path}")]
    TargetConflict {
        /// The conflicting path under the target.
        path: String,
    },

    /// A part's bytes do not hash to the checksum recorded at packing time.
    #[error("checksum mismatch in part {part}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Part index.
        part: u32,
        /// Recorded checksum.
        expected: Digest,
        /// Observed checksum.
        actual: Digest,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking worker panicked or was cancelled.
    #[error("pack worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for PackError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Worker(e.to_string())
    }
}
