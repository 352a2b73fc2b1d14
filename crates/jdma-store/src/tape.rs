//! Tape-backed elastic store.
//!
//! Parts are kept as files under `{root}/{volume}/`, but every operation has
//! to acquire one of a small number of drives, and reads pay a recall delay
//! before the first byte arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jdma_types::{BackendKind, Digest, PartHandle};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, trace};

use crate::backend::{PartKey, StorageBackend};
use crate::error::StoreError;

/// File-backed tape volume with a bounded drive pool.
pub struct TapeBackend {
    root: PathBuf,
    volume: String,
    drives: Arc<Semaphore>,
    recall_latency: Duration,
}

impl TapeBackend {
    /// Create a tape volume under `root` with two drives and no recall delay.
    pub fn new(root: impl AsRef<Path>, volume: impl Into<String>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let volume = volume.into();
        std::fs::create_dir_all(root.join(&volume))?;
        Ok(Self {
            root,
            volume,
            drives: Arc::new(Semaphore::new(2)),
            recall_latency: Duration::ZERO,
        })
    }

    /// Set the number of drives that can be in use at once.
    pub fn drives(mut self, n: usize) -> Self {
        self.drives = Arc::new(Semaphore::new(n.max(1)));
        self
    }

    /// Set the delay paid before any read from the volume.
    pub fn recall_latency(mut self, latency: Duration) -> Self {
        self.recall_latency = latency;
        self
    }

    /// Number of drives not currently in use.
    pub fn idle_drives(&self) -> usize {
        self.drives.available_permits()
    }

    async fn mount(&self) -> Result<SemaphorePermit<'_>, StoreError> {
        self.drives
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable(format!("tape volume {} closed", self.volume)))
    }

    async fn recall(&self, handle: &PartHandle) {
        if !self.recall_latency.is_zero() {
            trace!(%handle, latency = ?self.recall_latency, "recalling from tape");
            tokio::time::sleep(self.recall_latency).await;
        }
    }

    fn resolve(&self, handle: &PartHandle) -> Result<PathBuf, StoreError> {
        let name = handle
            .as_str()
            .strip_prefix(&format!("{}/", self.volume))
            .ok_or_else(|| StoreError::NotFound(handle.clone()))?;
        let rel = Path::new(name);
        if !rel
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
        {
            return Err(StoreError::NotFound(handle.clone()));
        }
        Ok(self.root.join(&self.volume).join(rel))
    }
}

fn not_found_or_io(handle: &PartHandle, e: std::io::Error) -> StoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(handle.clone())
    } else {
        StoreError::Io(e)
    }
}

#[async_trait::async_trait]
impl StorageBackend for TapeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tape
    }

    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError> {
        let _drive = self.mount().await?;
        let handle = PartHandle::new(format!("{}/{}", self.volume, key.object_name()));
        let path = self.resolve(&handle)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        let size = tokio::fs::copy(source, &tmp_path).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(%handle, size, "wrote part to tape");
        Ok(handle)
    }

    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError> {
        let _drive = self.mount().await?;
        let path = self.resolve(handle)?;
        self.recall(handle).await;
        tokio::fs::copy(&path, target)
            .await
            .map_err(|e| not_found_or_io(handle, e))
    }

    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError> {
        let _drive = self.mount().await?;
        let path = self.resolve(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%handle, "deleted part from tape");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError> {
        let _drive = self.mount().await?;
        let path = self.resolve(handle)?;
        self.recall(handle).await;
        tokio::task::spawn_blocking(move || Digest::of_file(&path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
            .map_err(|e| not_found_or_io(handle, e))
    }
}
