//! In-process object store backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use bytes::Bytes;
use jdma_types::{BackendKind, Digest, PartHandle};
use tracing::debug;

use crate::backend::{PartKey, StorageBackend};
use crate::error::StoreError;

/// Object store backed by a `RwLock<HashMap>` of immutable objects.
///
/// Handles are `{bucket}/{object_name}`. Tracks total bytes stored against a
/// configurable maximum.
pub struct ObjectStoreBackend {
    bucket: String,
    objects: RwLock<HashMap<String, Bytes>>,
    max_bytes: u64,
}

impl ObjectStoreBackend {
    /// Create an empty bucket with the given capacity limit.
    pub fn new(bucket: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Whether an object exists for the handle.
    pub fn contains(&self, handle: &PartHandle) -> bool {
        self.objects
            .read()
            .expect("lock poisoned")
            .contains_key(handle.as_str())
    }

    fn used_bytes_unlocked(map: &HashMap<String, Bytes>) -> u64 {
        map.values().map(|v| v.len() as u64).sum()
    }

    fn lookup(&self, handle: &PartHandle) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(handle.clone()))
    }
}

#[async_trait::async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let name = format!("{}/{}", self.bucket, key.object_name());

        let mut map = self.objects.write().expect("lock poisoned");
        let used = Self::used_bytes_unlocked(&map);
        let existing = map.get(&name).map_or(0, |v| v.len() as u64);
        let net_increase = (data.len() as u64).saturating_sub(existing);
        if used + net_increase > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed: net_increase,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        debug!(object = %name, size = data.len(), "put object");
        map.insert(name.clone(), data);
        Ok(PartHandle::new(name))
    }

    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError> {
        let data = self.lookup(handle)?;
        tokio::fs::write(target, &data).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError> {
        let mut map = self.objects.write().expect("lock poisoned");
        if map.remove(handle.as_str()).is_some() {
            debug!(object = %handle, "deleted object");
        }
        Ok(())
    }

    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError> {
        let data = self.lookup(handle)?;
        Ok(Digest::of(&data))
    }
}

#[cfg(test)]
mod tests {
    use jdma_types::BatchId;

    use super::*;

    async fn write_source(dir: &Path, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join("part.tar");
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_store_retrieve_verify() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source(dir.path(), b"object payload").await;
        let store = ObjectStoreBackend::new("jdma", 1024);

        let handle = store
            .store(&PartKey::new(BatchId::new(1), 0), &src)
            .await
            .unwrap();
        assert_eq!(handle.as_str(), "jdma/batch-1/part-00000.tar");
        assert!(store.contains(&handle));

        let out = dir.path().join("out");
        let n = store.retrieve(&handle, &out).await.unwrap();
        assert_eq!(n, 14);
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"object payload");
        assert_eq!(
            store.verify(&handle).await.unwrap(),
            Digest::of(b"object payload")
        );
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_source(dir.path(), &[0u8; 100]).await;
        let store = ObjectStoreBackend::new("jdma", 150);

        store
            .store(&PartKey::new(BatchId::new(1), 0), &src)
            .await
            .unwrap();
        let err = store
            .store(&PartKey::new(BatchId::new(1), 1), &src)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CapacityExceeded {
                needed: 100,
                available: 50
            }
        ));

        // Overwriting the same key only counts the net increase.
        store
            .store(&PartKey::new(BatchId::new(1), 0), &src)
            .await
            .unwrap();
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = ObjectStoreBackend::new("jdma", 1024);
        let handle = PartHandle::from("jdma/batch-9/part-00000.tar");
        assert!(matches!(
            store.verify(&handle).await,
            Err(StoreError::NotFound(_))
        ));
        // Delete of a missing object is a no-op.
        store.delete(&handle).await.unwrap();
    }
}
