//! Orchestrator restarts: state lives in the store, so a new process picks
//! up exactly where the old one stopped.

use std::time::Duration;

use jdma_integration_tests::{
    DISK, SiteConfig, TAPE, TestSite, assert_same_files, get_params, params,
};
use jdma_types::{BatchStage, Claim, RequestKind, RequestState};

const FILES: &[(&str, usize)] = &[("a.nc", 30_000), ("b.nc", 45_000), ("c/d.nc", 8_000)];

#[tokio::test]
async fn test_active_request_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (batch, id) = {
        let site = TestSite::open(dir.path(), SiteConfig::default());
        let batch = site.register("resume", DISK, FILES).await;
        let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();
        site.advance_to(id, RequestState::Transferring).await;
        site.orch().wait_background().await;
        (batch, id)
    };

    let site = TestSite::open(dir.path(), SiteConfig::default());
    let active = site.orch().meta().active_requests().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].state, RequestState::Transferring);

    // Packed parts survived in staging; the new scheduler only has to upload.
    site.run_scheduler().await;
    assert_eq!(site.status(id).state, RequestState::Completed);
    assert_eq!(site.stage(batch), BatchStage::OnStorage);

    let target = site.path("restore");
    let get = site
        .submit(batch, RequestKind::Get, get_params(&target, &[]))
        .await
        .unwrap();
    assert_eq!(site.drive(get).await, RequestState::Completed);
    assert_same_files(&site.path("sources/resume"), &target, &["a.nc", "b.nc", "c/d.nc"]);
}

#[tokio::test]
async fn test_claim_of_dead_scheduler_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let config = SiteConfig {
        staleness_window: Duration::from_millis(500),
        ..SiteConfig::default()
    };

    let id = {
        let site = TestSite::open(dir.path(), config.clone());
        let batch = site.register("orphan", TAPE, FILES).await;
        let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();
        site.advance_to(id, RequestState::Packing).await;
        // The previous scheduler died holding the request.
        site.orch()
            .meta()
            .transition_request(id, RequestState::Packing, |r| {
                r.claim = Some(Claim {
                    owner: "sched-dead".to_string(),
                    at: 0,
                });
            })
            .unwrap();
        id
    };

    let site = TestSite::open(dir.path(), config);
    let scheduler = site.run_scheduler().await;

    let request = site.orch().get_request(id).unwrap();
    assert_eq!(request.state, RequestState::Completed);
    assert_eq!(request.stall_count, 1);
    assert!(request.claim.is_none());
    assert_eq!(scheduler.stats().stalled, 1);
}

#[tokio::test]
async fn test_quota_and_ids_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (first_batch, consumed) = {
        let site = TestSite::open(dir.path(), SiteConfig::default());
        let batch = site.stored_batch("kept", DISK, FILES).await;
        (batch, site.usage(DISK).consumed)
    };
    assert!(consumed > 0);

    let site = TestSite::open(dir.path(), SiteConfig::default());
    assert_eq!(site.usage(DISK).consumed, consumed);
    assert_eq!(site.stage(first_batch), BatchStage::OnStorage);

    let second = site.register("next", DISK, FILES).await;
    assert!(second > first_batch);
}
