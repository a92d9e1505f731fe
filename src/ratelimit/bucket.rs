//! Per-identity log of admission timestamps.

use async_trait::async_trait;

use crate::error::Result;

/// Capability set over one identity's admission history.
///
/// Implementations are cheap handles onto a store; the store, not the
/// handle, owns the data.
#[async_trait]
pub trait Bucket: Send + Sync + std::fmt::Debug {
    /// The identity this bucket meters.
    fn identity(&self) -> &str;

    /// Largest number of timestamps the bucket retains.
    fn max_size(&self) -> usize;

    /// Current number of retained timestamps.
    async fn size(&self) -> Result<usize>;

    /// Record `timestamp` if the bucket is below `max_size`, keeping the
    /// history ascending even when it is older than the newest entry.
    ///
    /// Returns whether the timestamp was recorded.
    async fn put(&self, timestamp: f64) -> Result<bool>;

    /// Remove the `n` oldest timestamps, returning how many were removed.
    async fn evict(&self, n: usize) -> Result<usize>;

    /// All retained timestamps, oldest first.
    async fn all_timestamps(&self) -> Result<Vec<f64>>;

    /// Delete the whole history.
    async fn flush(&self) -> Result<()>;

    /// Count timestamps newer than `cutoff` and time until the oldest of them
    /// also passes it.
    async fn count_unexpired(&self, cutoff: f64) -> Result<(usize, f64)> {
        let timestamps = self.all_timestamps().await?;
        Ok(count_unexpired(&timestamps, cutoff))
    }
}

/// Scan an ascending history for the first entry strictly after `cutoff`.
///
/// Returns `(0, 0.0)` when nothing is still valid.
pub fn count_unexpired(timestamps: &[f64], cutoff: f64) -> (usize, f64) {
    timestamps
        .iter()
        .position(|ts| *ts > cutoff)
        .map(|idx| (timestamps.len() - idx, timestamps[idx] - cutoff))
        .unwrap_or((0, 0.0))
}
