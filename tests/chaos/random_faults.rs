//! Chaos test: random transient backend faults under concurrent load.
//!
//! Many batches are PUT across all three backends while faults are queued
//! at random. Whatever each request's outcome, the books must balance
//! afterwards: no request is left active, no reservation leaks, consumed
//! quota matches the stored batches, and every stored batch restores intact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jdma_integration_tests::{
    DISK, OBJECT_STORE, SiteConfig, TAPE, TestSite, assert_same_files, get_params, params,
};
use jdma_store::{Fault, Op};
use jdma_types::{BatchId, BatchStage, RequestId, RequestKind, RequestState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time;

const BATCHES: usize = 24;
const SEED: u64 = 0x4A44_4D41;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_faults_keep_books_balanced() {
    let site = Arc::new(TestSite::with_config(SiteConfig {
        part_ceiling: 16 * 1024,
        ..SiteConfig::default()
    }));
    let mut rng = StdRng::seed_from_u64(SEED);
    let backends = [OBJECT_STORE, DISK, TAPE];

    let scheduler = Arc::new(site.scheduler());
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(stop_rx).await })
    };

    // --- Load: submit PUTs while faults are injected ---
    let mut puts: Vec<(BatchId, RequestId, String)> = Vec::new();
    for i in 0..BATCHES {
        let name = format!("chaos-{i:02}");
        let backend = backends[i % backends.len()];
        let files: Vec<(String, usize)> = (0..rng.random_range(1..6))
            .map(|f| (format!("f{f}.dat"), rng.random_range(500..40_000)))
            .collect();
        let refs: Vec<(&str, usize)> = files.iter().map(|(p, s)| (p.as_str(), *s)).collect();

        let batch = site.register(&name, backend, &refs).await;
        let id = site.submit(batch, RequestKind::Put, params()).await.unwrap();
        puts.push((batch, id, name));

        if rng.random_bool(0.5) {
            let target = backends[rng.random_range(0..backends.len())];
            let op = if rng.random_bool(0.7) { Op::Store } else { Op::Verify };
            let times = rng.random_range(1..=4);
            site.backend(target).fail_next(op, Fault::Unavailable, times);
        }
        time::sleep(Duration::from_millis(rng.random_range(0..15))).await;
    }

    // --- Wait for every request to settle ---
    let settled = time::timeout(Duration::from_secs(60), async {
        loop {
            if site.orch().meta().active_requests().unwrap().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    stop_tx.send(true).unwrap();
    runner.await.unwrap();
    assert!(settled.is_ok(), "requests still active after 60s");

    // --- Invariants ---
    let mut stored_bytes: HashMap<&str, u64> = HashMap::new();
    let mut completed = Vec::new();
    for (batch, id, name) in &puts {
        let status = site.status(*id);
        let record = site.orch().get_batch(*batch).unwrap();
        match status.state {
            RequestState::Completed => {
                assert_eq!(record.stage, BatchStage::OnStorage, "{name}");
                let parts = site.orch().list_parts(*batch).unwrap();
                assert!(!parts.is_empty());
                assert!(parts.iter().all(|p| p.handle.is_some()), "{name}");
                *stored_bytes.entry(backend_name(&record.backend)).or_default() +=
                    record.total_bytes;
                completed.push((*batch, name.clone()));
            }
            RequestState::Failed => {
                assert_eq!(record.stage, BatchStage::Failed, "{name}");
                assert!(status.failure.is_some());
                assert!(site.orch().list_parts(*batch).unwrap().is_empty(), "{name}");
            }
            other => panic!("{name} left in {other}"),
        }
    }
    for backend in backends {
        let usage = site.usage(backend);
        assert_eq!(usage.reserved(), 0, "reservation leaked on {backend}");
        assert_eq!(usage.stored.values().sum::<u64>(), usage.consumed, "{backend}");
        assert_eq!(
            usage.consumed,
            stored_bytes.get(backend).copied().unwrap_or(0),
            "consumed quota on {backend} does not match stored batches"
        );
    }
    assert!(!completed.is_empty(), "no PUT survived the faults");

    // --- Every stored batch restores intact ---
    for backend in backends {
        site.backend(backend).heal();
    }
    for (batch, name) in &completed {
        let target = site.path(&format!("restore/{name}"));
        let get = site
            .submit(*batch, RequestKind::Get, get_params(&target, &[]))
            .await
            .unwrap();
        assert_eq!(site.drive(get).await, RequestState::Completed, "{name}");
        let files: Vec<String> = site
            .orch()
            .list_files(*batch)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        assert_same_files(&site.path(&format!("sources/{name}")), &target, &refs);
    }
}

fn backend_name(id: &jdma_types::BackendId) -> &'static str {
    match id.as_str() {
        OBJECT_STORE => OBJECT_STORE,
        DISK => DISK,
        TAPE => TAPE,
        other => panic!("unexpected backend {other}"),
    }
}
