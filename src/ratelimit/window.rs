//! Sliding-window evaluation over bucket primitives.
//!
//! This is the check-all-then-write-all sequence run by stores that serialize
//! admissions in process. The Redis store runs the same sequence server side.

use std::sync::Arc;

use tracing::{trace, warn};

use super::backend::Admission;
use super::bucket::Bucket;
use super::tier::RateTier;
use crate::error::{Rejection, Result};

/// Run one admission against `buckets`.
///
/// Callers must guarantee no other admission on the same buckets interleaves
/// with this call.
pub(crate) async fn evaluate(
    buckets: &[Arc<dyn Bucket>],
    tiers: &[RateTier],
    now: f64,
) -> Result<Admission> {
    let last = tiers.len().saturating_sub(1);
    let mut trims = vec![0usize; buckets.len()];

    for (tier_idx, tier) in tiers.iter().enumerate() {
        let limit = tier.limit() as usize;

        for (bucket_idx, bucket) in buckets.iter().enumerate() {
            let volume = bucket.size().await?;
            if volume < limit {
                continue;
            }

            let cutoff = now - tier.interval_secs();
            let (valid, remaining) = bucket.count_unexpired(cutoff).await?;

            trace!(
                identity = bucket.identity(),
                tier = %tier,
                volume = volume,
                valid = valid,
                "Evaluated tier"
            );

            if valid >= limit {
                return Ok(Admission::Rejected(Rejection::new(
                    bucket.identity(),
                    *tier,
                    remaining,
                )));
            }

            if tier_idx == last {
                trims[bucket_idx] = volume - valid;
            }
        }
    }

    for (bucket, trim) in buckets.iter().zip(trims) {
        if trim > 0 {
            bucket.evict(trim).await?;
        }
        if !bucket.put(now).await? {
            warn!(
                identity = bucket.identity(),
                max_size = bucket.max_size(),
                "Bucket refused an admitted timestamp"
            );
        }
    }

    Ok(Admission::Admitted)
}
