//! End-to-end acceptance scenarios.
//!
//! Each test drives real packing, real staging directories and the
//! scheduler over fault-injectable backends.

use std::time::Duration;

use jdma_engine::EngineError;
use jdma_integration_tests::{
    OBJECT_STORE, SiteConfig, TestSite, assert_same_files, get_params, params,
};
use jdma_store::{Fault, Op};
use jdma_types::events::{RequestStalled, StateChanged};
use jdma_types::{BatchStage, FailureReason, RequestKind, RequestState};

const MIB: u64 = 1024 * 1024;

/// Ten 5 MiB files.
fn fifty_megabytes() -> Vec<(String, usize)> {
    (0..10)
        .map(|i| (format!("run{}/tas_{i:02}.nc", i % 3), 5 * MIB as usize))
        .collect()
}

fn as_refs(files: &[(String, usize)]) -> Vec<(&str, usize)> {
    files.iter().map(|(p, s)| (p.as_str(), *s)).collect()
}

/// PUT of 50 MB with 100 MB free completes and consumes exactly 50 MB.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_within_quota_completes() {
    let site = TestSite::with_config(SiteConfig {
        quota: 100 * MIB,
        part_ceiling: 16 * MIB,
        ..SiteConfig::default()
    });
    let files = fifty_megabytes();
    let batch = site.register("cmip6", OBJECT_STORE, &as_refs(&files)).await;
    assert_eq!(site.usage(OBJECT_STORE).consumed, 0);

    let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();
    site.run_scheduler().await;

    assert_eq!(site.status(id).state, RequestState::Completed);
    let usage = site.usage(OBJECT_STORE);
    assert_eq!(usage.consumed, 50 * MIB);
    assert_eq!(usage.reserved(), 0);
    assert_eq!(site.stage(batch), BatchStage::OnStorage);

    // Every file landed in exactly one stored part.
    let parts = site.orch().list_parts(batch).unwrap();
    assert!(parts.len() >= 4);
    assert!(parts.iter().all(|p| p.handle.is_some()));
    let mut packed: Vec<&str> = parts
        .iter()
        .flat_map(|p| p.files.iter().map(String::as_str))
        .collect();
    packed.sort();
    let mut expected: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
    expected.sort();
    assert_eq!(packed, expected);

    // Staging is cleaned up after tidying.
    assert!(!site.orch().config().request_staging(batch, id).exists());
}

/// The same PUT with 10 MB free fails in PENDING and never packs.
#[tokio::test]
async fn test_put_over_quota_fails_before_packing() {
    let site = TestSite::with_config(SiteConfig {
        quota: 10 * MIB,
        part_ceiling: 16 * MIB,
        ..SiteConfig::default()
    });
    let files = fifty_megabytes();
    let batch = site.register("cmip6", OBJECT_STORE, &as_refs(&files)).await;
    let mut changes = site.orch().events().subscribe::<StateChanged>();

    let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();
    site.run_scheduler().await;

    let status = site.status(id);
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.failed_in, Some(RequestState::Pending));
    assert_eq!(
        status.failure,
        Some(FailureReason::QuotaExceeded {
            requested: 50 * MIB,
            available: 10 * MIB,
        })
    );
    assert!(changes.drain().iter().all(|c| c.to != RequestState::Packing));

    let usage = site.usage(OBJECT_STORE);
    assert_eq!(usage.consumed, 0);
    assert_eq!(usage.reserved(), 0);
    assert!(site.orch().list_parts(batch).unwrap().is_empty());
    assert_eq!(site.backend(OBJECT_STORE).calls(Op::Store), 0);
}

/// A GET whose only stored copy fails verification writes nothing.
#[tokio::test]
async fn test_get_of_corrupt_copy_fails_closed() {
    let site = TestSite::new();
    let files = [("tas.nc", 20_000), ("pr.nc", 12_000), ("README", 300)];
    let batch = site.stored_batch("single-part", OBJECT_STORE, &files).await;
    let parts = site.orch().list_parts(batch).unwrap();
    assert_eq!(parts.len(), 1);
    site.backend(OBJECT_STORE).corrupt(parts[0].handle.as_ref().unwrap());

    let target = site.path("restore");
    let id = site
        .submit(batch, RequestKind::Get, get_params(&target, &[]))
        .await
        .unwrap();
    site.run_scheduler().await;

    let status = site.status(id);
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(status.failed_in, Some(RequestState::Restoring));
    assert!(matches!(
        status.failure,
        Some(FailureReason::CorruptData { part: 0, .. })
    ));
    assert!(!target.exists(), "nothing may be written to the target");
    assert!(!site.orch().config().request_staging(batch, id).exists());
    assert_eq!(site.stage(batch), BatchStage::OnStorage);
}

/// With up-front verification off, the corrupt part is caught while
/// unpacking and the scratch tree is discarded.
#[tokio::test]
async fn test_get_verifying_during_unpack_fails_closed() {
    let site = TestSite::with_config(SiteConfig {
        verify_before_unpack: false,
        part_ceiling: 16 * 1024,
        ..SiteConfig::default()
    });
    let files = [("a.nc", 12_000), ("b.nc", 12_000), ("c.nc", 12_000)];
    let batch = site.stored_batch("late-check", OBJECT_STORE, &files).await;
    let parts = site.orch().list_parts(batch).unwrap();
    assert_eq!(parts.len(), 3);
    site.backend(OBJECT_STORE).corrupt(parts[2].handle.as_ref().unwrap());

    let target = site.path("restore");
    let id = site
        .submit(batch, RequestKind::Get, get_params(&target, &[]))
        .await
        .unwrap();
    site.run_scheduler().await;

    let status = site.status(id);
    assert_eq!(status.failed_in, Some(RequestState::Unpacking));
    assert!(matches!(
        status.failure,
        Some(FailureReason::CorruptData { part: 2, .. })
    ));
    let leftovers: Vec<_> = std::fs::read_dir(&target)
        .map(|entries| entries.collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "partial restore left behind: {leftovers:?}");
}

/// A DELETE cannot be submitted while a GET on the same batch is restoring.
#[tokio::test]
async fn test_delete_rejected_while_get_restoring() {
    let site = TestSite::new();
    let files = [("a.nc", 40_000), ("b.nc", 40_000)];
    let batch = site.stored_batch("busy", OBJECT_STORE, &files).await;

    let target = site.path("restore");
    let get = site
        .submit(batch, RequestKind::Get, get_params(&target, &[]))
        .await
        .unwrap();
    site.advance_to(get, RequestState::Restoring).await;

    let err = site
        .submit(batch, RequestKind::Delete, params())
        .await
        .unwrap_err();
    match err {
        EngineError::BatchBusy { batch: b, active } => {
            assert_eq!(b, batch);
            assert_eq!(active, get);
        }
        other => panic!("expected BatchBusy, got {other}"),
    }

    // Once the GET finishes the batch is free again.
    assert_eq!(site.drive(get).await, RequestState::Completed);
    assert_same_files(&site.path("sources/busy"), &target, &["a.nc", "b.nc"]);
    let delete = site.submit(batch, RequestKind::Delete, params()).await.unwrap();
    assert_eq!(site.drive(delete).await, RequestState::Completed);
    assert_eq!(site.stage(batch), BatchStage::Deleted);
}

/// A transfer that hangs past the staleness window is requeued once, then
/// fails with a stage timeout on the second stall.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hung_transfer_requeued_then_timed_out() {
    let site = TestSite::with_config(SiteConfig {
        staleness_window: Duration::from_millis(150),
        ..SiteConfig::default()
    });
    let batch = site.register("hang", OBJECT_STORE, &[("a.nc", 10_000)]).await;
    let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();
    let mut stalls = site.orch().events().subscribe::<RequestStalled>();
    site.backend(OBJECT_STORE).fail_next(Op::Store, Fault::Hang, 2);

    site.run_scheduler().await;

    let status = site.status(id);
    assert_eq!(status.state, RequestState::Failed);
    assert_eq!(
        status.failure,
        Some(FailureReason::StageTimeout {
            state: RequestState::Transferring
        })
    );
    let stalls = stalls.drain();
    assert_eq!(stalls.len(), 2);
    assert!(stalls[0].requeued);
    assert!(!stalls[1].requeued);
    assert!(stalls.iter().all(|s| s.state == RequestState::Transferring));

    assert_eq!(site.stage(batch), BatchStage::Failed);
    assert_eq!(site.usage(OBJECT_STORE).reserved(), 0);
    assert!(site.orch().inflight().is_empty());
}
