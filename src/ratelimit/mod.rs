//! Tiered sliding-window admission control.

mod backend;
mod bucket;
mod clock;
mod guard;
mod key;
mod limiter;
mod memory;
mod redis_store;
mod rules;
mod tier;
mod window;

pub use backend::{Admission, BucketStore};
pub use bucket::{count_unexpired, Bucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use guard::{AdmissionGuard, AdmissionPermit};
pub use key::{identity_or_anonymous, normalize_identities, BucketKey, ANONYMOUS, KEY_SEPARATOR};
pub use limiter::Limiter;
pub use memory::{MemoryBucket, MemoryStore, DEFAULT_NAMESPACE};
pub use redis_store::{
    RedisBucket, RedisStore, RedisStoreConfig, DEFAULT_CONNECT_RETRIES, DEFAULT_TIMEOUT,
};
pub use rules::TierRule;
pub use tier::{validate_tiers, RateTier, TimeUnit};
