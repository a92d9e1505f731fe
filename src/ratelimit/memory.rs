//! In-process bucket store.
//!
//! Shares history between every limiter in one process that holds the same
//! `Arc<MemoryStore>`. Admissions are serialized through a single async
//! mutex, which plays the role the server-side script plays for Redis.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::backend::{Admission, BucketStore};
use super::bucket::Bucket;
use super::key::BucketKey;
use super::tier::RateTier;
use super::window;
use crate::error::Result;

/// Default namespace for buckets.
pub const DEFAULT_NAMESPACE: &str = "tiergate";

type Logs = Arc<DashMap<String, MemoryLog>>;

#[derive(Debug)]
struct MemoryLog {
    /// Ascending
    items: VecDeque<f64>,
    touched: Instant,
}

impl MemoryLog {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            touched: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.map(|ttl| self.touched.elapsed() >= ttl).unwrap_or(false)
    }

    /// Insert in order; writers with skewed clocks may append older stamps.
    fn insert(&mut self, timestamp: f64) {
        let idx = self.items.partition_point(|ts| *ts <= timestamp);
        self.items.insert(idx, timestamp);
        self.touched = Instant::now();
    }
}

/// Store keeping bucket histories in process memory.
///
/// A history exists only while it holds timestamps and has not sat idle past
/// the TTL. Expired histories are dropped when next read and swept from the
/// map at most once per TTL period during admission.
#[derive(Debug)]
pub struct MemoryStore {
    namespace: String,
    ttl: Option<Duration>,
    logs: Logs,
    admission: tokio::sync::Mutex<()>,
    last_sweep: Mutex<Instant>,
}

impl MemoryStore {
    /// Create an empty store with the default namespace and no TTL.
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    /// Create an empty store whose keys use `namespace`.
    pub fn with_namespace(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ttl: None,
            logs: Arc::new(DashMap::new()),
            admission: tokio::sync::Mutex::new(()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Expire bucket histories that receive no append for `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Number of bucket histories currently held.
    pub fn bucket_count(&self) -> usize {
        self.logs.len()
    }

    /// Drop every history idle past the TTL, returning how many went.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };

        let before = self.logs.len();
        self.logs.retain(|_, log| !log.is_expired(Some(ttl)));
        let removed = before.saturating_sub(self.logs.len());

        if removed > 0 {
            debug!(removed = removed, "Purged expired in-memory buckets");
        }
        removed
    }

    fn sweep_if_due(&self) {
        let Some(ttl) = self.ttl else {
            return;
        };

        {
            let mut last = self.last_sweep.lock();
            if last.elapsed() < ttl {
                return;
            }
            *last = Instant::now();
        }
        self.purge_expired();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    fn open(&self, identity: &str, max_size: usize) -> Arc<dyn Bucket> {
        Arc::new(MemoryBucket {
            key: BucketKey::new(&self.namespace, identity).to_store_key(),
            identity: identity.to_string(),
            max_size,
            ttl: self.ttl,
            logs: Arc::clone(&self.logs),
        })
    }

    async fn admit(
        &self,
        buckets: &[Arc<dyn Bucket>],
        tiers: &[RateTier],
        now: f64,
    ) -> Result<Admission> {
        let _serial = self.admission.lock().await;
        self.sweep_if_due();
        window::evaluate(buckets, tiers, now).await
    }
}

/// Handle on one identity's in-memory history.
///
/// Holds the key rather than the history, so a handle outliving an expired
/// history sees the replacement created by the next append.
#[derive(Debug)]
pub struct MemoryBucket {
    key: String,
    identity: String,
    max_size: usize,
    ttl: Option<Duration>,
    logs: Logs,
}

impl MemoryBucket {
    /// Run `f` over the live history, if there is one.
    fn read<T>(&self, f: impl FnOnce(&MemoryLog) -> T) -> Option<T> {
        if let Some(log) = self.logs.get(&self.key) {
            if !log.is_expired(self.ttl) {
                return Some(f(log.value()));
            }
        }

        self.logs.remove_if(&self.key, |_, log| log.is_expired(self.ttl));
        None
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.read(|log| log.items.len()).unwrap_or(0))
    }

    async fn put(&self, timestamp: f64) -> Result<bool> {
        let mut log = self
            .logs
            .entry(self.key.clone())
            .or_insert_with(|| {
                debug!(key = %self.key, "Creating in-memory bucket");
                MemoryLog::new()
            });

        if log.is_expired(self.ttl) {
            log.items.clear();
        }
        if log.items.len() >= self.max_size {
            return Ok(false);
        }

        log.value_mut().insert(timestamp);
        Ok(true)
    }

    async fn evict(&self, n: usize) -> Result<usize> {
        let removed = match self.logs.get_mut(&self.key) {
            Some(mut log) => {
                if log.is_expired(self.ttl) {
                    log.items.clear();
                }
                let removed = n.min(log.items.len());
                log.items.drain(..removed);
                removed
            }
            None => 0,
        };

        self.logs.remove_if(&self.key, |_, log| log.items.is_empty());
        Ok(removed)
    }

    async fn all_timestamps(&self) -> Result<Vec<f64>> {
        Ok(self
            .read(|log| log.items.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn flush(&self) -> Result<()> {
        self.logs.remove(&self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_respects_max_size() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let bucket = store.open("alice", 2);

            assert!(bucket.put(1.0).await.unwrap());
            assert!(bucket.put(2.0).await.unwrap());
            assert!(!bucket.put(3.0).await.unwrap());
            assert_eq!(bucket.all_timestamps().await.unwrap(), vec![1.0, 2.0]);
        });
    }

    #[test]
    fn test_put_keeps_history_ascending() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let bucket = store.open("alice", 5);

            for ts in [3.0, 1.0, 4.0, 2.0, 2.0] {
                assert!(bucket.put(ts).await.unwrap());
            }
            assert_eq!(
                bucket.all_timestamps().await.unwrap(),
                vec![1.0, 2.0, 2.0, 3.0, 4.0]
            );
        });
    }

    #[test]
    fn test_evict_removes_oldest() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let bucket = store.open("alice", 5);
            for ts in [1.0, 2.0, 3.0] {
                bucket.put(ts).await.unwrap();
            }

            assert_eq!(bucket.evict(2).await.unwrap(), 2);
            assert_eq!(bucket.all_timestamps().await.unwrap(), vec![3.0]);

            // Asking for more than is there removes what exists
            assert_eq!(bucket.evict(10).await.unwrap(), 1);
            assert_eq!(bucket.size().await.unwrap(), 0);
            assert_eq!(store.bucket_count(), 0);
        });
    }

    #[test]
    fn test_handles_share_history() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let first = store.open("alice", 5);
            let second = store.open("alice", 5);

            first.put(1.0).await.unwrap();
            assert_eq!(second.size().await.unwrap(), 1);
            assert_eq!(store.bucket_count(), 1);

            second.flush().await.unwrap();
            assert_eq!(first.size().await.unwrap(), 0);
            assert_eq!(store.bucket_count(), 0);
        });
    }

    #[test]
    fn test_open_is_lazy() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let bucket = store.open("alice", 5);

            assert_eq!(bucket.size().await.unwrap(), 0);
            assert_eq!(bucket.evict(3).await.unwrap(), 0);
            assert_eq!(store.bucket_count(), 0);
        });
    }

    #[test]
    fn test_namespaces_are_isolated() {
        tokio_test::block_on(async {
            let store_a = MemoryStore::with_namespace("a");
            let store_b = MemoryStore::with_namespace("b");

            store_a.open("alice", 5).put(1.0).await.unwrap();
            assert_eq!(store_b.open("alice", 5).size().await.unwrap(), 0);
        });
    }

    #[tokio::test]
    async fn test_idle_bucket_expires() {
        let store = MemoryStore::new().with_ttl(Duration::from_millis(20));
        let bucket = store.open("alice", 5);
        bucket.put(1.0).await.unwrap();
        assert_eq!(bucket.size().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(bucket.size().await.unwrap(), 0);
        assert_eq!(store.bucket_count(), 0);

        // The same handle starts a fresh history
        bucket.put(2.0).await.unwrap();
        assert_eq!(bucket.all_timestamps().await.unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn test_expired_histories_are_removed() {
        let store = MemoryStore::new().with_ttl(Duration::from_millis(10));
        for i in 0..1000 {
            let identity = format!("10.0.{}.{}", i / 256, i % 256);
            store.open(&identity, 5).put(1.0).await.unwrap();
        }
        assert_eq!(store.bucket_count(), 1000);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired(), 1000);
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_admission_sweeps_expired_histories() {
        let store = MemoryStore::new().with_ttl(Duration::from_millis(50));
        let tiers = vec![RateTier::new(5, Duration::from_secs(60)).unwrap()];
        for i in 0..100 {
            let bucket = store.open(&format!("user-{}", i), 5);
            store.admit(&[bucket], &tiers, 1.0).await.unwrap();
        }
        assert_eq!(store.bucket_count(), 100);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let bucket = store.open("fresh", 5);
        store.admit(&[bucket], &tiers, 2.0).await.unwrap();
        assert_eq!(store.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_count_unexpired_through_trait() {
        let store = MemoryStore::new();
        let bucket = store.open("alice", 5);
        for ts in [1.0, 5.0, 8.0] {
            bucket.put(ts).await.unwrap();
        }

        assert_eq!(bucket.count_unexpired(4.0).await.unwrap(), (2, 1.0));
        assert_eq!(bucket.count_unexpired(8.0).await.unwrap(), (0, 0.0));
    }
}
