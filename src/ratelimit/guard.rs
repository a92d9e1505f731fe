//! Reusable admission guard with optional wait-and-retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::key::normalize_identities;
use super::limiter::Limiter;
use crate::error::{LimiterError, Rejection, Result};

/// A limiter bound to a fixed identity set.
///
/// Without delay, a rejection is returned as soon as it happens. With delay,
/// the guard sleeps for the rejection's remaining time and checks again,
/// giving up once a single wait would exceed `max_delay`.
#[derive(Debug, Clone)]
pub struct AdmissionGuard {
    limiter: Arc<Limiter>,
    identities: Vec<String>,
    delay: bool,
    max_delay: Option<Duration>,
}

/// Proof of a successful acquisition, held for the guarded scope.
///
/// Releasing it frees nothing: the admission is already recorded in the
/// store and ages out on its own.
#[derive(Debug)]
#[must_use = "the permit marks the guarded scope"]
pub struct AdmissionPermit<'a> {
    guard: &'a AdmissionGuard,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        trace!(identities = ?self.guard.identities, "Admission scope released");
    }
}

impl AdmissionGuard {
    /// Create a guard that surfaces rejections immediately.
    pub fn new<I, S>(limiter: Arc<Limiter>, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            limiter,
            identities: normalize_identities(identities),
            delay: false,
            max_delay: None,
        }
    }

    /// Wait out rejections, as long as each wait is at most `max_delay`.
    ///
    /// `None` or a zero duration means no bound.
    pub fn with_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.delay = true;
        self.max_delay = max_delay.filter(|d| !d.is_zero());
        self
    }

    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// Acquire an admission, waiting and retrying if configured to.
    ///
    /// # Errors
    /// - [`LimiterError::TooManyRequests`] when not delaying, or when the
    ///   required wait exceeds `max_delay`
    /// - [`LimiterError::Store`] immediately on any store failure
    pub async fn acquire(&self) -> Result<()> {
        loop {
            match self.limiter.try_acquire(&self.identities).await {
                Ok(()) => return Ok(()),
                Err(LimiterError::TooManyRequests(rejection)) => {
                    let wait = self.delay_or_reject(rejection)?;
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Acquire and hold a permit for the duration of a scope.
    pub async fn enter(&self) -> Result<AdmissionPermit<'_>> {
        self.acquire().await?;
        Ok(AdmissionPermit { guard: self })
    }

    /// Acquire, then drive `task` to completion.
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.enter().await?;
        Ok(task.await)
    }

    /// Decide whether to wait out a rejection; return the wait, or the
    /// rejection as a terminal error.
    fn delay_or_reject(&self, rejection: Rejection) -> Result<Duration> {
        let wait = rejection.remaining();
        debug!(
            identity = %rejection.identity(),
            remaining = ?wait,
            "Rate limit reached"
        );

        let exceeds_max = self.max_delay.map(|max| wait > max).unwrap_or(false);
        if self.delay && !exceeds_max {
            Ok(wait)
        } else {
            Err(LimiterError::TooManyRequests(rejection))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::ratelimit::{Admission, Bucket, BucketStore, MemoryStore, RateTier};

    fn limiter(limit: u32, interval: Duration) -> Arc<Limiter> {
        let tier = RateTier::new(limit, interval).unwrap();
        Arc::new(Limiter::new(vec![tier], Arc::new(MemoryStore::new())).unwrap())
    }

    #[tokio::test]
    async fn test_guard_without_delay_rejects() {
        let limiter = limiter(1, Duration::from_secs(60));
        let guard = limiter.ratelimit(["alice"], false, None);

        guard.acquire().await.unwrap();
        let err = guard.acquire().await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(err.rejection().unwrap().identity(), "alice");
    }

    #[tokio::test]
    async fn test_guard_with_delay_waits_and_retries() {
        let limiter = limiter(1, Duration::from_millis(60));
        let guard = limiter.ratelimit(["alice"], true, None);

        guard.acquire().await.unwrap();
        let started = tokio::time::Instant::now();
        guard.acquire().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(limiter.current_volume("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_guard_rejects_when_wait_exceeds_max_delay() {
        let limiter = limiter(1, Duration::from_secs(30));
        let guard = limiter.ratelimit(["alice"], true, Some(Duration::from_millis(10)));

        guard.acquire().await.unwrap();
        let started = tokio::time::Instant::now();
        let err = guard.acquire().await.unwrap_err();

        assert!(err.is_rejection());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_max_delay_means_unbounded() {
        let limiter = limiter(1, Duration::from_millis(30));
        let guard = limiter.ratelimit(["alice"], true, Some(Duration::ZERO));

        guard.acquire().await.unwrap();
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_scoped_permit_and_run() {
        let limiter = limiter(2, Duration::from_secs(60));
        let guard = AdmissionGuard::new(Arc::clone(&limiter), ["alice"]);

        {
            let _permit = guard.enter().await.unwrap();
            assert_eq!(limiter.current_volume("alice").await.unwrap(), 1);
        }

        let value = guard.run(async { 42 }).await.unwrap();
        assert_eq!(value, 42);

        // Third attempt is over the limit and never runs the task
        let ran = AtomicUsize::new(0);
        let result = guard
            .run(async {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(result.unwrap_err().is_rejection());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    /// Store whose admission always fails, counting attempts.
    #[derive(Debug, Default)]
    struct UnavailableStore {
        attempts: AtomicUsize,
        inner: MemoryStore,
    }

    #[async_trait]
    impl BucketStore for UnavailableStore {
        fn open(&self, identity: &str, max_size: usize) -> Arc<dyn Bucket> {
            self.inner.open(identity, max_size)
        }

        async fn admit(
            &self,
            _buckets: &[Arc<dyn Bucket>],
            _tiers: &[RateTier],
            _now: f64,
        ) -> Result<Admission> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }
    }

    /// Store that lets a competing caller take the freed slot right before
    /// the guard's retry.
    #[derive(Debug, Default)]
    struct ContendedStore {
        attempts: AtomicUsize,
        stolen: AtomicBool,
        inner: MemoryStore,
    }

    #[async_trait]
    impl BucketStore for ContendedStore {
        fn open(&self, identity: &str, max_size: usize) -> Arc<dyn Bucket> {
            self.inner.open(identity, max_size)
        }

        async fn admit(
            &self,
            buckets: &[Arc<dyn Bucket>],
            tiers: &[RateTier],
            now: f64,
        ) -> Result<Admission> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= 2 && !self.stolen.load(Ordering::SeqCst) {
                let competitor = self.inner.admit(buckets, tiers, now).await?;
                if competitor == Admission::Admitted {
                    self.stolen.store(true, Ordering::SeqCst);
                }
            }
            self.inner.admit(buckets, tiers, now).await
        }
    }

    #[tokio::test]
    async fn test_guard_waits_again_when_slot_is_taken() {
        let store = Arc::new(ContendedStore::default());
        let tier = RateTier::new(1, Duration::from_millis(50)).unwrap();
        let limiter = Arc::new(Limiter::new(vec![tier], store.clone()).unwrap());
        let guard = limiter.ratelimit(["alice"], true, None);

        // Attempt 0 fills the bucket
        guard.acquire().await.unwrap();

        // The first retry loses the freed slot to a competitor, so the guard
        // has to wait a second time
        let started = tokio::time::Instant::now();
        guard.acquire().await.unwrap();

        assert!(store.stolen.load(Ordering::SeqCst));
        assert!(store.attempts.load(Ordering::SeqCst) >= 4);
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(limiter.current_volume("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_guard_does_not_retry_store_failures() {
        let store = Arc::new(UnavailableStore::default());
        let tier = RateTier::new(1, Duration::from_secs(1)).unwrap();
        let limiter = Arc::new(Limiter::new(vec![tier], store.clone()).unwrap());
        let guard = limiter.ratelimit(["alice"], true, None);

        let err = guard.acquire().await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }
}
