//! On-disk cache backend.
//!
//! Stores one file per part under a 2-level fan-out directory derived from
//! the batch id: `{base_dir}/{id % 256:02x}/batch-{id}/part-{index:05}.tar`.

use std::path::{Path, PathBuf};

use jdma_types::{BackendKind, Digest, PartHandle};
use tracing::debug;

use crate::backend::{PartKey, StorageBackend};
use crate::error::StoreError;

/// File-based part store.
///
/// Writes are atomic: the part is copied to a temporary file first, then
/// renamed into place, so a crashed upload never leaves a half-written part
/// under its final name.
pub struct DiskBackend {
    base_dir: PathBuf,
}

impl DiskBackend {
    /// Create a disk backend rooted at the given directory (created if missing).
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn relative_name(key: &PartKey) -> String {
        format!("{:02x}/{}", key.batch_id.get() % 256, key.object_name())
    }

    /// Resolve a handle to a path, refusing anything that escapes `base_dir`.
    fn resolve(&self, handle: &PartHandle) -> Result<PathBuf, StoreError> {
        let rel = Path::new(handle.as_str());
        let safe = rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !safe {
            return Err(StoreError::NotFound(handle.clone()));
        }
        Ok(self.base_dir.join(rel))
    }
}

#[async_trait::async_trait]
impl StorageBackend for DiskBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError> {
        let handle = PartHandle::new(Self::relative_name(key));
        let path = self.resolve(&handle)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        let size = tokio::fs::copy(source, &tmp_path).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(path = %path.display(), size, "stored part on disk");
        Ok(handle)
    }

    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError> {
        let path = self.resolve(handle)?;
        match tokio::fs::copy(&path, target).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(handle.clone()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError> {
        let path = self.resolve(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%handle, "deleted part file");
                // Drop the per-batch directory once it is empty; ignore failure.
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::remove_dir(parent).await;
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError> {
        let path = self.resolve(handle)?;
        let result = tokio::task::spawn_blocking(move || Digest::of_file(&path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        match result {
            Ok(digest) => Ok(digest),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(handle.clone()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}
