//! Core trait for storage backends.

use std::path::Path;

use jdma_types::{BackendKind, BatchId, Digest, PartHandle};

use crate::error::StoreError;

/// Identifies the part being stored. Backends derive their handle from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartKey {
    pub batch_id: BatchId,
    pub index: u32,
}

impl PartKey {
    pub fn new(batch_id: BatchId, index: u32) -> Self {
        Self { batch_id, index }
    }

    /// Stable object name, e.g. `batch-12/part-00003.tar`.
    pub fn object_name(&self) -> String {
        format!("batch-{}/part-{:05}.tar", self.batch_id, self.index)
    }
}

/// Trait for moving packed archive parts to and from a storage tier.
///
/// All implementations must be `Send + Sync` for use across worker tasks.
/// Parts move as files so that multi-gigabyte archives never have to sit in
/// memory on the orchestrator side.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// The backend family, used for concurrency and retry defaults.
    fn kind(&self) -> BackendKind;

    /// Store the file at `source` as the given part. Storing the same key
    /// again overwrites the previous copy.
    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError>;

    /// Copy a stored part into `target`, returning the number of bytes written.
    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError>;

    /// Delete a stored part. Deleting a missing part succeeds.
    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError>;

    /// Re-read a stored part and return its SHA-256 digest.
    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_is_zero_padded() {
        let key = PartKey::new(BatchId::new(12), 3);
        assert_eq!(key.object_name(), "batch-12/part-00003.tar");
    }
}
