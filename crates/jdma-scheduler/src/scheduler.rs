//! Polling scheduler: claims runnable requests and advances them on
//! per-backend worker pools.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use jdma_engine::{Advance, Orchestrator};
use jdma_types::{BackendId, Request, RequestId, RequestState, now_millis};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;

/// What one [`Scheduler::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Requests claimed and handed to a worker.
    pub dispatched: usize,
    /// Requests skipped because a live worker holds them.
    pub blocked: usize,
    /// Requests left for a later tick because their pool was full.
    pub deferred: usize,
    /// Expired claims handed to stall handling.
    pub stalled: usize,
}

/// Counters since the scheduler started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub advanced: u64,
    pub failed: u64,
    pub skipped: u64,
    pub stalled: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    advanced: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    stalled: AtomicU64,
    errors: AtomicU64,
}

/// Dispatches non-terminal requests, FIFO by (creation time, id), to a
/// bounded worker pool per backend.
///
/// Respects:
/// - Claims (a request held by a live worker is never dispatched twice).
/// - Per-backend concurrency (one semaphore per registered backend).
/// - The staleness window (each step runs under a timeout).
pub struct Scheduler {
    orch: Orchestrator,
    pools: HashMap<BackendId, Arc<Semaphore>>,
    /// Used for requests whose backend is not registered; they fail fast.
    fallback: Arc<Semaphore>,
    owner: String,
    staleness_window: Duration,
    poll_interval: Duration,
    running: Arc<Mutex<HashSet<RequestId>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Scheduler {
    /// Build a scheduler over `orch`, taking pool sizes from its registry and
    /// timing from its configuration.
    pub fn new(orch: Orchestrator) -> Self {
        let pools = orch
            .registry()
            .entries()
            .map(|e| (e.id.clone(), Arc::new(Semaphore::new(e.concurrency))))
            .collect();
        let config = orch.config();
        Self {
            owner: config.scheduler_id.clone(),
            staleness_window: config.staleness_window,
            poll_interval: config.poll_interval,
            pools,
            fallback: Arc::new(Semaphore::new(1)),
            running: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            orch,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Free worker slots for a backend.
    pub fn pool_available(&self, backend: &BackendId) -> Option<usize> {
        self.pools.get(backend).map(|p| p.available_permits())
    }

    /// Number of requests this scheduler is currently advancing.
    pub fn running(&self) -> usize {
        self.running.lock().expect("running lock poisoned").len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            advanced: c.advanced.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            stalled: c.stalled.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// Run the scheduler loop until `shutdown` becomes `true`, then wait for
    /// in-flight workers.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            owner = %self.owner,
            poll_interval = ?self.poll_interval,
            staleness_window = ?self.staleness_window,
            pools = self.pools.len(),
            "scheduler started"
        );
        let mut tick = interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(report) if report.dispatched + report.stalled > 0 => {
                    debug!(
                        dispatched = report.dispatched,
                        blocked = report.blocked,
                        deferred = report.deferred,
                        stalled = report.stalled,
                        "scheduler tick"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
        }

        info!(running = self.running(), "scheduler stopping, waiting for workers");
        self.wait_idle().await;
    }

    /// Scan the state index once and dispatch what can run.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let mut active = self.orch.meta().active_requests()?;
        active.sort_by_key(|r| (r.created_at, r.id));

        let now = now_millis();
        let claim_expiry = 2 * self.staleness_window.as_millis() as u64;
        let mut report = TickReport::default();

        for request in active {
            if self.is_running(request.id) {
                report.blocked += 1;
                continue;
            }

            if let Some(claim) = &request.claim {
                if now.saturating_sub(claim.at) <= claim_expiry {
                    report.blocked += 1;
                    continue;
                }
                warn!(
                    request_id = %request.id,
                    state = %request.state,
                    claimed_by = %claim.owner,
                    "claim expired"
                );
                self.counters.stalled.fetch_add(1, Ordering::Relaxed);
                report.stalled += 1;
                if let Err(e) = self.orch.handle_stall(request.id, request.state).await {
                    error!(request_id = %request.id, error = %e, "stall handling failed");
                }
                continue;
            }

            let pool = match self.pool_for(&request) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(request_id = %request.id, error = %e, "cannot resolve worker pool");
                    continue;
                }
            };
            let Ok(permit) = pool.try_acquire_owned() else {
                report.deferred += 1;
                continue;
            };

            if !self.orch.claim(request.id, request.state, &self.owner)? {
                report.blocked += 1;
                continue;
            }
            self.dispatch(request.id, request.state, permit);
            report.dispatched += 1;
        }

        Ok(report)
    }

    /// Tick and wait for the workers until a tick dispatches nothing.
    pub async fn run_until_idle(&self) -> Result<(), SchedulerError> {
        loop {
            let report = self.tick().await?;
            self.wait_idle().await;
            if report.dispatched == 0 && report.stalled == 0 {
                return Ok(());
            }
        }
    }

    /// Wait for every dispatched worker and any compensation they started.
    pub async fn wait_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await
                    && !e.is_cancelled()
                {
                    error!(error = %e, "worker task panicked");
                }
            }
        }
        self.orch.wait_background().await;
    }

    /// Every request is paced by the pool of its batch's backend.
    fn pool_for(&self, request: &Request) -> Result<Arc<Semaphore>, SchedulerError> {
        let backend = self.orch.get_batch(request.batch_id)?.backend;
        Ok(self
            .pools
            .get(&backend)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn is_running(&self, id: RequestId) -> bool {
        self.running
            .lock()
            .expect("running lock poisoned")
            .contains(&id)
    }

    fn dispatch(&self, id: RequestId, state: RequestState, permit: OwnedSemaphorePermit) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.running
            .lock()
            .expect("running lock poisoned")
            .insert(id);
        debug!(request_id = %id, %state, "dispatching request");

        let guard = RunningGuard {
            id,
            running: self.running.clone(),
            orch: self.orch.clone(),
        };
        let orch = self.orch.clone();
        let counters = self.counters.clone();
        let owner = self.owner.clone();
        let window = self.staleness_window;
        let (start_tx, start_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            // Wait until the abort handle is registered.
            if start_rx.await.is_err() {
                return;
            }

            match timeout(window, orch.advance(id, state)).await {
                Ok(Ok(Advance::Moved { from, to })) => {
                    counters.advanced.fetch_add(1, Ordering::Relaxed);
                    debug!(request_id = %id, %from, %to, "step finished");
                }
                Ok(Ok(Advance::Failed { reason })) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(request_id = %id, %state, reason = reason.code(), "step failed");
                }
                Ok(Ok(Advance::Skipped)) => {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = orch.release_claim(id, state, &owner) {
                        warn!(request_id = %id, error = %e, "failed to release claim");
                    }
                }
                Ok(Err(e)) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(request_id = %id, %state, error = %e, "advance failed");
                    if let Err(e) = orch.release_claim(id, state, &owner) {
                        warn!(request_id = %id, error = %e, "failed to release claim");
                    }
                }
                Err(_) => {
                    counters.stalled.fetch_add(1, Ordering::Relaxed);
                    warn!(request_id = %id, %state, window = ?window, "step exceeded staleness window");
                    match orch.handle_stall(id, state).await {
                        Ok(outcome) => debug!(request_id = %id, ?outcome, "stall handled"),
                        Err(e) => error!(request_id = %id, error = %e, "stall handling failed"),
                    }
                }
            }
        });

        self.orch.inflight().register(id, handle.abort_handle());
        let _ = start_tx.send(());

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

/// Clears the request's running and in-flight entries when its worker ends,
/// including when the worker is aborted.
struct RunningGuard {
    id: RequestId,
    running: Arc<Mutex<HashSet<RequestId>>>,
    orch: Orchestrator,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.orch.inflight().finish(self.id);
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.id);
        }
    }
}
