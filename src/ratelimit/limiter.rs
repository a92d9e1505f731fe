//! Core limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::backend::{Admission, BucketStore};
use super::bucket::Bucket;
use super::clock::{Clock, SystemClock};
use super::guard::AdmissionGuard;
use super::key::normalize_identities;
use super::tier::{validate_tiers, RateTier};
use crate::error::{LimiterError, Result};

/// A cached bucket handle and the last time an admission touched it.
#[derive(Debug, Clone)]
struct CachedBucket {
    bucket: Arc<dyn Bucket>,
    last_used: f64,
}

/// Multi-tier sliding-window limiter.
///
/// Every tier is enforced at once against one bucket per identity. The
/// shared store is the source of truth; the limiter keeps only a cache of
/// bucket handles and can be shared freely across tasks.
///
/// A handle unused for longer than the loosest tier's interval can no longer
/// hold a live timestamp, so it is pruned from the cache.
#[derive(Debug)]
pub struct Limiter {
    /// Tiers, loosest first
    tiers: Vec<RateTier>,
    /// Store the buckets live in
    store: Arc<dyn BucketStore>,
    /// Bucket handles indexed by identity
    buckets: DashMap<String, CachedBucket>,
    /// Time source for admission timestamps
    clock: Arc<dyn Clock>,
    /// Clock reading of the last handle prune
    last_prune: Mutex<f64>,
}

impl Limiter {
    /// Create a limiter enforcing `tiers` against buckets in `store`.
    ///
    /// # Errors
    /// Returns [`LimiterError::Config`] if `tiers` is empty or not strictly
    /// increasing in both limit and interval.
    pub fn new(tiers: Vec<RateTier>, store: Arc<dyn BucketStore>) -> Result<Self> {
        validate_tiers(&tiers)?;

        debug!(
            tiers = ?tiers.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            "Creating limiter"
        );

        Ok(Self {
            tiers,
            store,
            buckets: DashMap::new(),
            clock: Arc::new(SystemClock::new()),
            last_prune: Mutex::new(f64::NEG_INFINITY),
        })
    }

    /// Replace the clock used to timestamp admissions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configured tiers, loosest first.
    pub fn tiers(&self) -> &[RateTier] {
        &self.tiers
    }

    /// Largest history any bucket keeps: the strictest tier's limit.
    pub fn max_bucket_size(&self) -> usize {
        self.tiers.last().map(|t| t.limit() as usize).unwrap_or(0)
    }

    /// Longest interval any tier looks back over.
    fn horizon_secs(&self) -> f64 {
        self.tiers
            .iter()
            .map(|t| t.interval_secs())
            .fold(0.0, f64::max)
    }

    /// Get or open the bucket handle for an identity, marking it used at `now`.
    fn bucket(&self, identity: &str, now: f64) -> Arc<dyn Bucket> {
        if let Some(mut cached) = self.buckets.get_mut(identity) {
            cached.last_used = cached.last_used.max(now);
            return Arc::clone(&cached.bucket);
        }

        self.buckets
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(identity = %identity, max_size = self.max_bucket_size(), "Opening bucket");
                CachedBucket {
                    bucket: self.store.open(identity, self.max_bucket_size()),
                    last_used: now,
                }
            })
            .bucket
            .clone()
    }

    /// Cached handle if there is one, otherwise a fresh uncached one.
    fn peek(&self, identity: &str) -> Arc<dyn Bucket> {
        match self.buckets.get(identity) {
            Some(cached) => Arc::clone(&cached.bucket),
            None => self.store.open(identity, self.max_bucket_size()),
        }
    }

    /// Drop handles idle past the longest tier interval, at most once per
    /// that interval.
    fn prune_idle_handles(&self, now: f64) {
        let horizon = self.horizon_secs();
        {
            let mut last = self.last_prune.lock();
            if now - *last < horizon {
                return;
            }
            *last = now;
        }

        let before = self.buckets.len();
        self.buckets.retain(|_, cached| now - cached.last_used < horizon);
        let pruned = before.saturating_sub(self.buckets.len());

        if pruned > 0 {
            debug!(pruned = pruned, "Pruned idle bucket handles");
        }
    }

    /// Try to admit one request on behalf of every identity in `identities`.
    ///
    /// The identities are treated as one unit: either every bucket records
    /// the admission or none does.
    ///
    /// # Errors
    /// - [`LimiterError::TooManyRequests`] if any tier is full for any identity
    /// - [`LimiterError::Store`] if the backing store fails
    pub async fn try_acquire<I, S>(&self, identities: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identities = normalize_identities(identities);
        if identities.is_empty() {
            trace!("No identities supplied, nothing to meter");
            return Ok(());
        }

        let now = self.clock.now();
        self.prune_idle_handles(now);
        let buckets: Vec<Arc<dyn Bucket>> =
            identities.iter().map(|id| self.bucket(id, now)).collect();

        trace!(identities = ?identities, now = now, "Checking admission");

        match self.store.admit(&buckets, &self.tiers, now).await? {
            Admission::Admitted => Ok(()),
            Admission::Rejected(rejection) => {
                debug!(
                    identity = %rejection.identity(),
                    tier = %rejection.tier(),
                    remaining = ?rejection.remaining(),
                    "Admission rejected"
                );
                Err(LimiterError::TooManyRequests(rejection))
            }
        }
    }

    /// Wrap this limiter and a fixed identity set in a reusable guard.
    ///
    /// With `delay`, the guard waits out rejections no longer than
    /// `max_delay` (unbounded when `None` or zero).
    pub fn ratelimit<I, S>(
        self: &Arc<Self>,
        identities: I,
        delay: bool,
        max_delay: Option<Duration>,
    ) -> AdmissionGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let guard = AdmissionGuard::new(Arc::clone(self), identities);
        if delay {
            guard.with_delay(max_delay)
        } else {
            guard
        }
    }

    /// Number of timestamps currently held for `identity`.
    ///
    /// Reading never adds to the handle cache.
    pub async fn current_volume(&self, identity: &str) -> Result<usize> {
        self.peek(identity).size().await
    }

    /// Clear the history of one identity and forget its handle.
    pub async fn flush(&self, identity: &str) -> Result<()> {
        self.peek(identity).flush().await?;
        self.buckets.remove(identity);
        Ok(())
    }

    /// Clear every bucket this limiter holds a handle for, returning how many.
    ///
    /// The handle cache is emptied afterwards.
    pub async fn flush_all(&self) -> Result<usize> {
        let buckets: Vec<(String, Arc<dyn Bucket>)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().bucket)))
            .collect();

        try_join_all(buckets.iter().map(|(_, bucket)| bucket.flush())).await?;
        for (identity, _) in &buckets {
            self.buckets.remove(identity);
        }

        info!(count = buckets.len(), "Flushed all buckets");
        Ok(buckets.len())
    }

    /// Get the number of identities with a cached bucket handle.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every cached bucket handle.
    ///
    /// Handles reopen on next use; no history is lost.
    pub fn clear_handles(&self) {
        self.buckets.clear();
    }
}
