//! Lookup from stored backend identifiers to adapters.

use std::collections::BTreeMap;
use std::sync::Arc;

use jdma_types::{BackendId, BackendKind};
use tracing::info;

use crate::backend::StorageBackend;
use crate::retry::{RetryPolicy, RetryingBackend};

/// One registered backend.
#[derive(Clone)]
pub struct BackendEntry {
    pub id: BackendId,
    pub kind: BackendKind,
    /// The adapter, already wrapped in its retry policy.
    pub backend: Arc<dyn StorageBackend>,
    /// Maximum concurrent requests the scheduler dispatches to it.
    pub concurrency: usize,
}

impl std::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Registered backends, keyed by the identifier stored on each batch.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    entries: BTreeMap<BackendId, BackendEntry>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default worker-pool size for a backend family.
    pub fn default_concurrency(kind: BackendKind) -> usize {
        match kind {
            BackendKind::ObjectStore => 8,
            BackendKind::Disk => 4,
            BackendKind::Tape => 2,
        }
    }

    /// Register `backend` wrapped in the default retry policy and pool size for its kind.
    pub fn register(&mut self, id: impl Into<BackendId>, backend: Arc<dyn StorageBackend>) {
        let kind = backend.kind();
        self.register_with(
            id,
            backend,
            RetryPolicy::for_kind(kind),
            Self::default_concurrency(kind),
        );
    }

    /// Register with an explicit retry policy and pool size.
    pub fn register_with(
        &mut self,
        id: impl Into<BackendId>,
        backend: Arc<dyn StorageBackend>,
        policy: RetryPolicy,
        concurrency: usize,
    ) {
        let id = id.into();
        let kind = backend.kind();
        info!(backend = %id, %kind, concurrency, "registered storage backend");
        let wrapped = RetryingBackend::new(backend, policy).named(id.as_str());
        self.entries.insert(
            id.clone(),
            BackendEntry {
                id,
                kind,
                backend: Arc::new(wrapped),
                concurrency: concurrency.max(1),
            },
        );
    }

    pub fn get(&self, id: &BackendId) -> Option<&BackendEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.entries.contains_key(id)
    }

    /// All entries, ordered by identifier.
    pub fn entries(&self) -> impl Iterator<Item = &BackendEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
