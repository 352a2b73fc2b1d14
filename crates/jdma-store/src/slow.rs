//! A [`StorageBackend`] wrapper that adds configurable random latency.
//!
//! The RNG is seeded for reproducible behaviour across test runs.
//!
//! ```ignore
//! let slow = SlowBackend::new(inner)
//!     .read_latency(5, 20)    // 5–20 ms per retrieve/verify
//!     .write_latency(10, 30)  // 10–30 ms per store/delete
//!     .seed(42);
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};

use jdma_types::{BackendKind, Digest, PartHandle};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::backend::{PartKey, StorageBackend};
use crate::error::StoreError;

/// Injects random latency before each backend operation.
pub struct SlowBackend {
    inner: Arc<dyn StorageBackend>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
}

impl SlowBackend {
    /// Wrap an existing backend with zero latency (pass-through) by default.
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    async fn delay(&self, (min, max): (u64, u64)) {
        if max == 0 {
            return;
        }
        let ms = if min >= max {
            max
        } else {
            self.rng
                .lock()
                .expect("rng lock poisoned")
                .random_range(min..=max)
        };
        if ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for SlowBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.store(key, source).await
    }

    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.retrieve(handle, target).await
    }

    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.inner.delete(handle).await
    }

    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.inner.verify(handle).await
    }
}
