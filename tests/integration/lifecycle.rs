//! Request lifecycles across backends: transition order, round trips,
//! migration off the workspace, retry and notifications.

use jdma_engine::{Advance, EngineError, Outcome, RequestFilter};
use jdma_integration_tests::{
    ATTEMPTS, DISK, OBJECT_STORE, TAPE, TestSite, assert_same_files, get_params, params,
};
use jdma_store::{Fault, Op};
use jdma_types::events::StateChanged;
use jdma_types::{BatchStage, FailureReason, RequestKind, RequestState};

const FILES: &[(&str, usize)] = &[
    ("README", 400),
    ("atmos/tas_day.nc", 50_000),
    ("atmos/pr_day.nc", 70_000),
    ("ocean/tos_mon.nc", 90_000),
];

fn names() -> Vec<&'static str> {
    FILES.iter().map(|(p, _)| *p).collect()
}

/// Every emitted transition is legal and each kind walks its full stage list.
#[tokio::test]
async fn test_transitions_follow_the_table() {
    let site = TestSite::new();
    let mut changes = site.orch().events().subscribe::<StateChanged>();

    let batch = site.register("table", DISK, FILES).await;
    let migrated = site.register("table-migrate", TAPE, FILES).await;
    let target = site.path("restore");
    let steps = [
        (batch, RequestKind::Put, params()),
        (batch, RequestKind::Get, get_params(&target, &[])),
        (batch, RequestKind::Delete, params()),
        (migrated, RequestKind::Migrate, params()),
    ];
    for (batch, kind, p) in steps {
        let id = site.submit(batch, kind, p).await.unwrap();
        site.run_scheduler().await;
        assert_eq!(site.status(id).state, RequestState::Completed, "{kind} did not complete");

        let seen: Vec<StateChanged> = changes.drain();
        assert!(seen.iter().all(|c| c.request_id == id));
        for change in &seen {
            assert!(
                kind.is_valid_transition(change.from, change.to),
                "{kind}: illegal {} -> {}",
                change.from,
                change.to
            );
        }
        let mut walked = vec![RequestState::Pending];
        walked.extend(seen.iter().map(|c| c.to));
        assert_eq!(walked, kind.stages(), "{kind} skipped or repeated a state");
    }
    assert_eq!(site.stage(batch), BatchStage::Deleted);
    assert_eq!(site.stage(migrated), BatchStage::OnStorage);
}

#[tokio::test]
async fn test_tape_round_trip_and_subset_restore() {
    let site = TestSite::new();
    let batch = site.stored_batch("tape", TAPE, FILES).await;
    let source = site.path("sources/tape");

    let full = site.path("full");
    let id = site
        .submit(batch, RequestKind::Get, get_params(&full, &[]))
        .await
        .unwrap();
    assert_eq!(site.drive(id).await, RequestState::Completed);
    assert_same_files(&source, &full, &names());

    let subset = site.path("subset");
    let id = site
        .submit(batch, RequestKind::Get, get_params(&subset, &["atmos/pr_day.nc"]))
        .await
        .unwrap();
    assert_eq!(site.drive(id).await, RequestState::Completed);
    assert_same_files(&source, &subset, &["atmos/pr_day.nc"]);
    assert!(!subset.join("atmos/tas_day.nc").exists());
    assert!(!subset.join("README").exists());
}

#[tokio::test]
async fn test_migrate_to_tape_frees_the_workspace() {
    let site = TestSite::new();
    let batch = site.register("tier", TAPE, FILES).await;
    let source = site.path("sources/tier");
    let originals: Vec<Vec<u8>> = names()
        .iter()
        .map(|rel| std::fs::read(source.join(rel)).unwrap())
        .collect();
    let total = site.orch().get_batch(batch).unwrap().total_bytes;

    let id = site.submit(batch, RequestKind::Migrate, params()).await.unwrap();
    site.run_scheduler().await;
    assert_eq!(site.status(id).state, RequestState::Completed);

    assert_eq!(site.stage(batch), BatchStage::OnStorage);
    assert_eq!(site.usage(TAPE).consumed, total);
    assert_eq!(site.usage(TAPE).reserved(), 0);
    assert!(site.backend(TAPE).calls(Op::Verify) >= site.orch().list_parts(batch).unwrap().len());
    for rel in names() {
        assert!(!source.join(rel).exists(), "{rel} left behind");
    }
    assert!(!source.join("atmos").exists());

    // A stored batch is only brought back with GET.
    let err = site.submit(batch, RequestKind::Migrate, params()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStage { .. }));

    let target = site.path("restore");
    let get = site
        .submit(batch, RequestKind::Get, get_params(&target, &[]))
        .await
        .unwrap();
    assert_eq!(site.drive(get).await, RequestState::Completed);
    for (rel, original) in names().iter().zip(&originals) {
        assert!(&std::fs::read(target.join(rel)).unwrap() == original, "{rel} differs");
    }
}

#[tokio::test]
async fn test_migrate_failure_leaves_sources_in_place() {
    let site = TestSite::new();
    let batch = site.register("stay", OBJECT_STORE, FILES).await;
    site.backend(OBJECT_STORE)
        .fail_next(Op::Verify, Fault::Unavailable, ATTEMPTS as usize);

    let id = site.submit(batch, RequestKind::Migrate, params()).await.unwrap();
    site.run_scheduler().await;
    let status = site.status(id);
    assert_eq!(status.failed_in, Some(RequestState::Verifying));
    assert_eq!(site.stage(batch), BatchStage::Failed);
    assert_eq!(site.usage(OBJECT_STORE).consumed, 0);
    assert_eq!(site.usage(OBJECT_STORE).reserved(), 0);
    for rel in names() {
        assert!(site.path("sources/stay").join(rel).exists());
    }

    // The batch can be migrated again once the backend recovers.
    let again = site.orch().retry_request(id).await.unwrap();
    site.run_scheduler().await;
    assert_eq!(site.status(again).state, RequestState::Completed);
    assert!(!site.path("sources/stay/README").exists());
}

#[tokio::test]
async fn test_deleted_batch_cannot_be_put_again() {
    let site = TestSite::new();
    let batch = site.stored_batch("gone", OBJECT_STORE, FILES).await;
    let id = site.submit(batch, RequestKind::Delete, params()).await.unwrap();
    assert_eq!(site.drive(id).await, RequestState::Completed);
    assert_eq!(site.usage(OBJECT_STORE).consumed, 0);
    assert!(
        site.orch()
            .list_parts(batch)
            .unwrap()
            .is_empty()
    );

    let err = site.submit(batch, RequestKind::Put, params()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStage {
            stage: BatchStage::Deleted,
            kind: RequestKind::Put,
            ..
        }
    ));
}

#[tokio::test]
async fn test_concurrent_advance_moves_once() {
    let site = TestSite::new();
    let batch = site.register("race", OBJECT_STORE, FILES).await;
    let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();

    let (a, b) = tokio::join!(
        site.orch().advance(id, RequestState::Pending),
        site.orch().advance(id, RequestState::Pending),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let moved = outcomes
        .iter()
        .filter(|o| matches!(o, Advance::Moved { .. }))
        .count();
    assert_eq!(moved, 1);
    assert!(outcomes.contains(&Advance::Skipped));
    assert_eq!(site.status(id).state, RequestState::Packing);
}

#[tokio::test]
async fn test_retry_after_backend_outage() {
    let site = TestSite::new();
    let batch = site.register("outage", OBJECT_STORE, FILES).await;
    let first = site.submit(batch, RequestKind::Put, params()).await.unwrap();
    site.backend(OBJECT_STORE)
        .fail_next(Op::Store, Fault::Unavailable, ATTEMPTS as usize);

    site.run_scheduler().await;
    let status = site.status(first);
    assert_eq!(status.failed_in, Some(RequestState::Transferring));
    assert!(matches!(
        status.failure,
        Some(FailureReason::BackendUnavailable { .. })
    ));
    assert_eq!(site.stage(batch), BatchStage::Failed);
    assert_eq!(site.usage(OBJECT_STORE).reserved(), 0);

    let second = site.orch().retry_request(first).await.unwrap();
    site.run_scheduler().await;
    assert_eq!(site.status(second).state, RequestState::Completed);
    assert_eq!(site.orch().get_request(second).unwrap().retry_of, Some(first));
    assert_eq!(site.stage(batch), BatchStage::OnStorage);

    let history = site
        .orch()
        .list_requests(&RequestFilter {
            batch_id: Some(batch),
            ..RequestFilter::default()
        })
        .unwrap();
    let states: Vec<RequestState> = history.iter().map(|r| r.state).collect();
    assert_eq!(states, vec![RequestState::Failed, RequestState::Completed]);
}

#[tokio::test]
async fn test_owner_notified_of_each_outcome() {
    let site = TestSite::new();
    let good = site.register("good", OBJECT_STORE, FILES).await;
    let bad = site.register("bad", OBJECT_STORE, FILES).await;

    let ok = site.submit(good, RequestKind::Put, params()).await.unwrap();
    site.run_scheduler().await;

    std::fs::remove_file(site.path("sources/bad/README")).unwrap();
    let failed = site.submit(bad, RequestKind::Put, params()).await.unwrap();
    site.run_scheduler().await;
    site.orch().wait_background().await;

    let sent = site.notifier().sent();
    let for_ok = sent.iter().find(|n| n.request_id == ok).unwrap();
    assert_eq!(for_ok.outcome, Outcome::Completed);
    let for_failed = sent.iter().find(|n| n.request_id == failed).unwrap();
    assert_eq!(for_failed.outcome, Outcome::Failed);
    assert!(for_failed.detail.contains("PENDING"));
    assert!(sent.iter().all(|n| n.address == "carol@example.org"));
}
