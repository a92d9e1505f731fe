//! Store trait abstracting the in-memory and Redis bucket backends.

use std::sync::Arc;

use async_trait::async_trait;

use super::bucket::Bucket;
use super::tier::RateTier;
use crate::error::{Rejection, Result};

/// Outcome of one atomic admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Every tier passed and `now` was recorded in every bucket.
    Admitted,
    /// A tier was exceeded; no bucket was touched.
    Rejected(Rejection),
}

/// Factory and atomic admission primitive for buckets in one shared store.
///
/// The limiter owns no locks. Whatever serializes concurrent check-and-append
/// sequences for the same identity lives behind [`BucketStore::admit`].
#[async_trait]
pub trait BucketStore: Send + Sync + std::fmt::Debug {
    /// Open a handle on the bucket for `identity`.
    ///
    /// Opening is lazy and never touches the store; the bucket itself comes
    /// into existence on its first append.
    fn open(&self, identity: &str, max_size: usize) -> Arc<dyn Bucket>;

    /// Evaluate `tiers` against `buckets` at `now` and, only if every tier
    /// passes for every bucket, trim expired history and append `now` to each.
    ///
    /// The read, decision and write happen as one indivisible unit with
    /// respect to other `admit` calls on the same store.
    async fn admit(
        &self,
        buckets: &[Arc<dyn Bucket>],
        tiers: &[RateTier],
        now: f64,
    ) -> Result<Admission>;
}
