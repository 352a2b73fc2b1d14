//! Retry policy and the [`RetryingBackend`] wrapper.
//!
//! Delays follow `min(max_backoff, 2^i * min_backoff + rand_i)` where `rand_i`
//! is a uniform jitter in `[0, max_jitter]`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jdma_types::{BackendKind, Digest, PartHandle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::backend::{PartKey, StorageBackend};
use crate::error::StoreError;

/// How often and how patiently transient backend errors are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub min_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Upper bound on the random offset added to each delay.
    pub max_jitter: Duration,
}

impl RetryPolicy {
    /// Default policy for a backend family.
    ///
    /// Tape recalls are slow and drives get contended, so tape backs off for
    /// minutes; object stores fail fast and recover fast.
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Tape => Self {
                max_attempts: 4,
                min_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(15 * 60),
                max_jitter: Duration::from_secs(1),
            },
            BackendKind::ObjectStore => Self {
                max_attempts: 6,
                min_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(10),
                max_jitter: Duration::from_millis(200),
            },
            BackendKind::Disk => Self {
                max_attempts: 3,
                min_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(2),
                max_jitter: Duration::from_millis(100),
            },
        }
    }

    /// Retry `max_attempts - 1` times without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delays between attempts, seeded for reproducibility.
    pub fn backoff(&self, seed: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: self.clone(),
            sequence_index: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// Iterator over the waits between attempts; yields `max_attempts - 1` items.
#[derive(Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    sequence_index: u32,
    rng: StdRng,
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.sequence_index + 1 >= self.policy.max_attempts {
            return None;
        }
        let jitter_ms = self.policy.max_jitter.as_millis() as u64;
        let offset = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.random_range(0..=jitter_ms))
        };
        let factor = 2u32.saturating_pow(self.sequence_index);
        let delay = self
            .policy
            .min_backoff
            .saturating_mul(factor)
            .saturating_add(offset)
            .min(self.policy.max_backoff);
        self.sequence_index = self.sequence_index.saturating_add(1);
        Some(delay)
    }
}

/// Applies a [`RetryPolicy`] to every operation of the wrapped backend.
///
/// Only [`StoreError::is_transient`] errors are retried; anything else is
/// returned on the first occurrence.
pub struct RetryingBackend {
    inner: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
    name: String,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            name: String::new(),
        }
    }

    /// Name used in log lines.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut backoff = self.policy.backoff(rand::random());
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(backend = %self.name, op, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            backend = %self.name,
                            op,
                            attempt,
                            ?delay,
                            error = %e,
                            "transient backend error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(backend = %self.name, op, attempt, error = %e, "retry budget exhausted");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for RetryingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn store(&self, key: &PartKey, source: &Path) -> Result<PartHandle, StoreError> {
        self.with_retry("store", || self.inner.store(key, source))
            .await
    }

    async fn retrieve(&self, handle: &PartHandle, target: &Path) -> Result<u64, StoreError> {
        self.with_retry("retrieve", || self.inner.retrieve(handle, target))
            .await
    }

    async fn delete(&self, handle: &PartHandle) -> Result<(), StoreError> {
        self.with_retry("delete", || self.inner.delete(handle)).await
    }

    async fn verify(&self, handle: &PartHandle) -> Result<Digest, StoreError> {
        self.with_retry("verify", || self.inner.verify(handle)).await
    }
}

#[cfg(test)]
mod tests {
    use jdma_types::BatchId;

    use super::*;
    use crate::{Fault, FaultyBackend, ObjectStoreBackend, Op};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            max_jitter: Duration::ZERO,
        };
        let delays: Vec<u64> = policy
            .backoff(1)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy::for_kind(BackendKind::ObjectStore);
        for (i, delay) in policy.backoff(99).enumerate() {
            let base = policy.min_backoff * 2u32.pow(i as u32);
            assert!(delay >= base.min(policy.max_backoff));
            assert!(delay <= policy.max_backoff);
            assert!(delay <= base + policy.max_jitter);
        }
        assert_eq!(policy.backoff(99).count(), 5);
    }

    #[test]
    fn test_kind_defaults() {
        let tape = RetryPolicy::for_kind(BackendKind::Tape);
        assert_eq!(tape.max_attempts, 4);
        assert_eq!(tape.min_backoff, Duration::from_secs(30));
        assert_eq!(tape.max_backoff, Duration::from_secs(900));
        assert_eq!(RetryPolicy::for_kind(BackendKind::ObjectStore).max_attempts, 6);
        assert_eq!(RetryPolicy::for_kind(BackendKind::Disk).max_attempts, 3);
    }

    async fn faulty_pair() -> (tempfile::TempDir, Arc<FaultyBackend>, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("p");
        tokio::fs::write(&src, b"payload").await.unwrap();
        let faulty = Arc::new(FaultyBackend::new(Arc::new(ObjectStoreBackend::new(
            "b",
            1 << 20,
        ))));
        (dir, faulty, src)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (_dir, faulty, src) = faulty_pair().await;
        faulty.fail_next(Op::Store, Fault::Unavailable, 2);
        let retrying = RetryingBackend::new(faulty.clone(), RetryPolicy::immediate(3));

        retrying
            .store(&PartKey::new(BatchId::new(1), 0), &src)
            .await
            .unwrap();
        assert_eq!(faulty.calls(Op::Store), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_last_error() {
        let (_dir, faulty, src) = faulty_pair().await;
        faulty.fail_next(Op::Store, Fault::Unavailable, 10);
        let retrying = RetryingBackend::new(faulty.clone(), RetryPolicy::immediate(4));

        let err = retrying
            .store(&PartKey::new(BatchId::new(1), 0), &src)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(faulty.calls(Op::Store), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let (_dir, faulty, _src) = faulty_pair().await;
        let retrying = RetryingBackend::new(faulty.clone(), RetryPolicy::immediate(5));
        let handle = PartHandle::from("b/batch-1/part-00000.tar");

        assert!(matches!(
            retrying.verify(&handle).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(faulty.calls(Op::Verify), 1);
    }
}
