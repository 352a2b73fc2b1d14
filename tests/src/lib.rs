//! Shared test harness for JDMA integration tests.
//!
//! Provides [`TestSite`]: an orchestrator over three fault-injectable
//! backends (an in-memory object store, an on-disk cache and a file-backed
//! tape volume), a workspace with quota on each, and helpers to build source
//! trees and drive requests through the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jdma_engine::{EngineError, NewBatch, Orchestrator, RecordingNotifier};
use jdma_meta::MetaStore;
use jdma_scheduler::Scheduler;
use jdma_store::{
    BackendRegistry, DiskBackend, FaultyBackend, ObjectStoreBackend, RetryPolicy, SlowBackend,
    StorageBackend, TapeBackend,
};
use jdma_types::*;
use tempfile::TempDir;

pub const OWNER: &str = "carol";
pub const WORKSPACE: &str = "gws-cmip6";

pub const OBJECT_STORE: &str = "objectstore";
pub const DISK: &str = "disk";
pub const TAPE: &str = "elastictape";

/// Retry attempts per backend call before a step fails.
pub const ATTEMPTS: u32 = 3;

/// Knobs for a [`TestSite`].
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub part_ceiling: u64,
    pub staleness_window: Duration,
    /// Allocation for [`WORKSPACE`] on every backend.
    pub quota: u64,
    pub verify_before_unpack: bool,
    /// Worker pool size for the object store and disk backends.
    pub concurrency: usize,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            part_ceiling: 64 * 1024,
            staleness_window: Duration::from_secs(60),
            quota: 1 << 30,
            verify_before_unpack: true,
            concurrency: 4,
        }
    }
}

/// One orchestrator with its backends and a scratch directory.
pub struct TestSite {
    orch: Orchestrator,
    object_store: Arc<FaultyBackend>,
    disk: Arc<FaultyBackend>,
    tape: Arc<FaultyBackend>,
    notifier: Arc<RecordingNotifier>,
    root: PathBuf,
    // Declared last so everything above is dropped before the directory goes away.
    _dir: Option<TempDir>,
}

impl TestSite {
    /// A site in a fresh temporary directory with default settings.
    pub fn new() -> Self {
        Self::with_config(SiteConfig::default())
    }

    pub fn with_config(config: SiteConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut site = Self::open(dir.path(), config);
        site._dir = Some(dir);
        site
    }

    /// Open a site rooted at `root`, reusing any store and disk/tape
    /// contents left there by an earlier site. The object store starts empty.
    pub fn open(root: &Path, config: SiteConfig) -> Self {
        let meta = Arc::new(MetaStore::open(root.join("meta")).unwrap());

        let object_store = faulty(Arc::new(ObjectStoreBackend::new("jdma-cache", u64::MAX)));
        let disk = faulty(Arc::new(DiskBackend::new(root.join("disk")).unwrap()));
        let tape = TapeBackend::new(root.join("tape"), "ET0001").unwrap();
        // Tape is the slow tier: every mount costs a few milliseconds.
        let tape = faulty(Arc::new(
            SlowBackend::new(Arc::new(tape))
                .read_latency(1, 5)
                .write_latency(1, 5)
                .seed(7),
        ));

        let mut registry = BackendRegistry::new();
        for (name, backend, concurrency) in [
            (OBJECT_STORE, &object_store, config.concurrency),
            (DISK, &disk, config.concurrency),
            (TAPE, &tape, 2),
        ] {
            registry.register_with(
                name,
                backend.clone(),
                RetryPolicy::immediate(ATTEMPTS),
                concurrency,
            );
        }

        let orch_config = OrchestratorConfig {
            staging_dir: root.join("staging"),
            part_ceiling: config.part_ceiling,
            verify_before_unpack: config.verify_before_unpack,
            staleness_window: config.staleness_window,
            poll_interval: Duration::from_millis(10),
            scheduler_id: "sched-it".to_string(),
        };
        let notifier = Arc::new(RecordingNotifier::new());
        let orch = Orchestrator::new(meta, registry, notifier.clone(), orch_config);

        if orch.get_user(OWNER).is_err() {
            orch.register_user(User {
                name: OWNER.to_string(),
                email: Some(format!("{OWNER}@example.org")),
                notify: true,
            })
            .unwrap();
        }
        for backend in [OBJECT_STORE, DISK, TAPE] {
            orch.quota()
                .set_allocation(WORKSPACE, &BackendId::from(backend), config.quota)
                .unwrap();
        }

        Self {
            orch,
            object_store,
            disk,
            tape,
            notifier,
            root: root.to_path_buf(),
            _dir: None,
        }
    }

    pub fn orch(&self) -> &Orchestrator {
        &self.orch
    }

    pub fn notifier(&self) -> &RecordingNotifier {
        &self.notifier
    }

    /// Fault injector in front of the named backend.
    pub fn backend(&self, name: &str) -> &Arc<FaultyBackend> {
        match name {
            OBJECT_STORE => &self.object_store,
            DISK => &self.disk,
            TAPE => &self.tape,
            other => panic!("no backend named {other}"),
        }
    }

    /// A path inside the site's scratch directory.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Write a source tree of `(relative path, size)` files under `name`.
    pub fn write_tree(&self, name: &str, files: &[(&str, usize)]) -> PathBuf {
        let root = self.path("sources").join(name);
        for (i, (rel, size)) in files.iter().enumerate() {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let seed = name.bytes().fold(i as u32, |acc, b| acc.wrapping_mul(31) ^ b as u32);
            std::fs::write(&path, test_data_seeded(*size, seed)).unwrap();
        }
        root
    }

    /// Write a source tree and register it as a batch on `backend`.
    pub async fn register(&self, name: &str, backend: &str, files: &[(&str, usize)]) -> BatchId {
        let root = self.write_tree(name, files);
        self.orch
            .register_batch(NewBatch {
                owner: OWNER.to_string(),
                workspace: WORKSPACE.to_string(),
                backend: BackendId::from(backend),
                paths: vec![root],
                label: Some(name.to_string()),
            })
            .await
            .unwrap()
    }

    pub async fn submit(
        &self,
        batch: BatchId,
        kind: RequestKind,
        params: RequestParams,
    ) -> Result<RequestId, EngineError> {
        self.orch.submit_request(batch, kind, params).await
    }

    /// Register, PUT and drive the PUT to completion.
    pub async fn stored_batch(&self, name: &str, backend: &str, files: &[(&str, usize)]) -> BatchId {
        let batch = self.register(name, backend, files).await;
        let id = self.submit(batch, RequestKind::Put, params()).await.unwrap();
        assert_eq!(self.drive(id).await, RequestState::Completed);
        batch
    }

    /// Advance a request step by step until it is terminal, then wait for
    /// its notification and any compensation.
    pub async fn drive(&self, id: RequestId) -> RequestState {
        let state = self.orch.drive(id).await.unwrap();
        self.orch.wait_background().await;
        state
    }

    /// Advance a request step by step until it reaches `state`.
    pub async fn advance_to(&self, id: RequestId, state: RequestState) {
        loop {
            let current = self.status(id).state;
            if current == state {
                return;
            }
            assert!(!current.is_terminal(), "request {id} ended in {current} before {state}");
            self.orch.advance(id, current).await.unwrap();
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.orch.clone())
    }

    /// Run a fresh scheduler until nothing is left to dispatch.
    pub async fn run_scheduler(&self) -> Scheduler {
        let scheduler = self.scheduler();
        scheduler.run_until_idle().await.unwrap();
        scheduler
    }

    pub fn status(&self, id: RequestId) -> RequestStatus {
        self.orch.get_request_status(id).unwrap()
    }

    pub fn stage(&self, batch: BatchId) -> BatchStage {
        self.orch.get_batch(batch).unwrap().stage
    }

    pub fn usage(&self, backend: &str) -> QuotaRecord {
        self.orch
            .quota()
            .usage(WORKSPACE, &BackendId::from(backend))
            .unwrap()
    }
}

impl Default for TestSite {
    fn default() -> Self {
        Self::new()
    }
}

fn faulty(inner: Arc<dyn StorageBackend>) -> Arc<FaultyBackend> {
    Arc::new(FaultyBackend::new(inner))
}

/// Parameters with only the requester set.
pub fn params() -> RequestParams {
    RequestParams {
        requester: OWNER.to_string(),
        ..RequestParams::default()
    }
}

/// GET parameters restoring under `target`, optionally a subset of files.
pub fn get_params(target: &Path, files: &[&str]) -> RequestParams {
    RequestParams {
        target_path: Some(target.to_path_buf()),
        files: files.iter().map(|f| f.to_string()).collect(),
        ..params()
    }
}

/// Assert that every listed file under `restored` matches `source`.
pub fn assert_same_files(source: &Path, restored: &Path, files: &[&str]) {
    for rel in files {
        let original = std::fs::read(source.join(rel)).unwrap();
        let copy = std::fs::read(restored.join(rel))
            .unwrap_or_else(|e| panic!("{rel} not restored: {e}"));
        assert!(original == copy, "{rel} differs after restore");
    }
}

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Vec<u8> {
    test_data_seeded(size, 0xDEAD_BEEF)
}

/// Generate test data with a specific seed (for distinct files).
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}
