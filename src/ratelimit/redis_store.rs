//! Redis-backed bucket store.
//!
//! Lets every process that points at the same Redis and namespace enforce one
//! shared set of limits.
//!
//! ## Layout
//!
//! - One Redis list per identity, keyed `{namespace}___{identity}`
//! - Values are admission timestamps in seconds, kept ascending even when
//!   writers' clocks disagree
//! - Optional TTL, refreshed on every append, so idle identities disappear
//!
//! ## Atomicity
//!
//! Admission runs as a single Lua script over every key in the call: it reads
//! each list, evaluates all tiers, and only then trims and appends. Redis runs
//! scripts without interleaving other commands, so two processes racing on the
//! same identity cannot both pass a check that only one of them should.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, warn};

use super::backend::{Admission, BucketStore};
use super::bucket::Bucket;
use super::key::BucketKey;
use super::memory::DEFAULT_NAMESPACE;
use super::tier::RateTier;
use crate::error::{LimiterError, Rejection, Result};

/// Lua helper shared by both scripts: insert a timestamp keeping the list
/// ascending. Clocks of separate writers may disagree, so an append can carry
/// a stamp older than the current tail.
const INSERT_SORTED: &str = r#"
local function insert_sorted(key, stamp)
  local value = tonumber(stamp)
  local tail = redis.call('LINDEX', key, -1)
  if (not tail) or tonumber(tail) <= value then
    redis.call('RPUSH', key, stamp)
    return
  end
  local raw = redis.call('LRANGE', key, 0, -1)
  for i = 1, #raw do
    if tonumber(raw[i]) > value then
      redis.call('LINSERT', key, 'BEFORE', raw[i], stamp)
      return
    end
  end
  redis.call('RPUSH', key, stamp)
end
"#;

/// KEYS: bucket keys.
/// ARGV: now, max_size, ttl_ms (0 for none), tier_count, then limit/interval
/// pairs from loosest to strictest.
/// Returns {"0"} when admitted or {"1", key_index, tier_index, remaining}.
const ADMIT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local max_size = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local tier_count = tonumber(ARGV[4])
local trims = {}

for t = 1, tier_count do
  local limit = tonumber(ARGV[3 + 2 * t])
  local interval = tonumber(ARGV[4 + 2 * t])
  for k = 1, #KEYS do
    local volume = redis.call('LLEN', KEYS[k])
    if volume >= limit then
      local cutoff = now - interval
      local raw = redis.call('LRANGE', KEYS[k], 0, -1)
      local valid, remaining = 0, 0
      for i = 1, #raw do
        local stamp = tonumber(raw[i])
        if stamp > cutoff then
          valid = #raw - i + 1
          remaining = stamp - cutoff
          break
        end
      end
      if valid >= limit then
        return {'1', tostring(k), tostring(t), tostring(remaining)}
      end
      if t == tier_count then
        trims[k] = volume - valid
      end
    end
  end
end

for k = 1, #KEYS do
  if trims[k] and trims[k] > 0 then
    redis.call('LTRIM', KEYS[k], trims[k], -1)
  end
  if redis.call('LLEN', KEYS[k]) < max_size then
    insert_sorted(KEYS[k], ARGV[1])
  end
  if ttl_ms > 0 then
    redis.call('PEXPIRE', KEYS[k], ttl_ms)
  end
end
return {'0'}
"#;

/// KEYS: bucket key. ARGV: timestamp, max_size, ttl_ms (0 for none).
const PUT_SCRIPT: &str = r#"
if redis.call('LLEN', KEYS[1]) < tonumber(ARGV[2]) then
  insert_sorted(KEYS[1], ARGV[1])
  if tonumber(ARGV[3]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
  end
  return 1
end
return 0
"#;

fn script(body: &str) -> Script {
    Script::new(&format!("{}{}", INSERT_SORTED, body))
}

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix separating this limiter's buckets from others in the same Redis
    pub namespace: String,
    /// Expire a bucket after this long without an append (default: none)
    pub ttl: Option<Duration>,
    /// Bound on each connection attempt and each command reply
    pub timeout: Duration,
    /// Reconnect attempts after the first failure before giving up
    pub connect_retries: usize,
}

/// Default bound on connecting and on each command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of reconnect attempts.
pub const DEFAULT_CONNECT_RETRIES: usize = 2;

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: None,
            timeout: DEFAULT_TIMEOUT,
            connect_retries: DEFAULT_CONNECT_RETRIES,
        }
    }
}

impl RedisStoreConfig {
    fn connection_manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_number_of_retries(self.connect_retries)
            .set_connection_timeout(self.timeout)
            .set_response_timeout(self.timeout)
    }
}

/// Bucket store backed by Redis lists.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    admit_script: Arc<Script>,
    put_script: Arc<Script>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns [`LimiterError::Store`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        if config.namespace.is_empty() {
            return Err(LimiterError::Config(
                "bucket namespace must not be empty".to_string(),
            ));
        }

        if config.timeout.is_zero() {
            return Err(LimiterError::Config(
                "Redis timeout must be greater than zero".to_string(),
            ));
        }

        let client = Client::open(url)?;
        let connection =
            ConnectionManager::new_with_config(client, config.connection_manager_config()).await?;

        info!(
            namespace = %config.namespace,
            ttl = ?config.ttl,
            timeout = ?config.timeout,
            "Connected to Redis bucket store"
        );

        Ok(Self {
            connection,
            config,
            admit_script: Arc::new(script(ADMIT_SCRIPT)),
            put_script: Arc::new(script(PUT_SCRIPT)),
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, identity: &str) -> String {
        BucketKey::new(&self.config.namespace, identity).to_store_key()
    }

    fn ttl_ms(&self) -> u64 {
        ttl_millis(self.config.ttl)
    }

    /// Delete every bucket in this store's namespace, including ones this
    /// process never opened. Returns the number of keys deleted.
    pub async fn clear(&self) -> Result<usize> {
        let pattern = format!("{}*", BucketKey::new(&self.config.namespace, "").to_store_key());
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: usize = conn.del(&keys).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        info!(namespace = %self.config.namespace, deleted = deleted, "Cleared Redis buckets");
        Ok(deleted)
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    fn open(&self, identity: &str, max_size: usize) -> Arc<dyn Bucket> {
        let key = self.key(identity);
        debug!(key = %key, "Opening Redis bucket handle");

        Arc::new(RedisBucket {
            key,
            identity: identity.to_string(),
            max_size,
            ttl_ms: self.ttl_ms(),
            connection: self.connection.clone(),
            put_script: Arc::clone(&self.put_script),
        })
    }

    async fn admit(
        &self,
        buckets: &[Arc<dyn Bucket>],
        tiers: &[RateTier],
        now: f64,
    ) -> Result<Admission> {
        let max_size = tiers.last().map(|t| t.limit()).unwrap_or(0);

        let mut invocation = self.admit_script.prepare_invoke();
        for bucket in buckets {
            invocation.key(self.key(bucket.identity()));
        }
        invocation
            .arg(format_timestamp(now))
            .arg(max_size)
            .arg(self.ttl_ms())
            .arg(tiers.len());
        for tier in tiers {
            invocation.arg(tier.limit()).arg(tier.interval_secs());
        }

        let mut conn = self.connection.clone();
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        decode_admission(&reply, buckets, tiers)
    }
}

/// Turn the admission script's reply into an [`Admission`].
fn decode_admission(
    reply: &[String],
    buckets: &[Arc<dyn Bucket>],
    tiers: &[RateTier],
) -> Result<Admission> {
    let malformed = || LimiterError::CorruptBucket {
        key: "admission-script".to_string(),
        value: reply.join(","),
    };

    match reply {
        [flag] if flag == "0" => Ok(Admission::Admitted),
        [flag, key_idx, tier_idx, remaining] if flag == "1" => {
            let bucket = key_idx
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| buckets.get(i))
                .ok_or_else(malformed)?;
            let tier = tier_idx
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| tiers.get(i))
                .ok_or_else(malformed)?;
            let remaining: f64 = remaining.parse().map_err(|_| malformed())?;

            Ok(Admission::Rejected(Rejection::new(
                bucket.identity(),
                *tier,
                remaining,
            )))
        }
        _ => Err(malformed()),
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|t| t.as_millis().max(1) as u64).unwrap_or(0)
}

fn format_timestamp(ts: f64) -> String {
    format!("{:.6}", ts)
}

/// Handle on one identity's Redis list.
pub struct RedisBucket {
    key: String,
    identity: String,
    max_size: usize,
    ttl_ms: u64,
    connection: ConnectionManager,
    put_script: Arc<Script>,
}

impl fmt::Debug for RedisBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucket")
            .field("key", &self.key)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl RedisBucket {
    /// The Redis key holding this bucket.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Bucket for RedisBucket {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    async fn size(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        let len: usize = conn.llen(&self.key).await?;
        Ok(len)
    }

    async fn put(&self, timestamp: f64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let appended: i64 = self
            .put_script
            .key(&self.key)
            .arg(format_timestamp(timestamp))
            .arg(self.max_size)
            .arg(self.ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(appended == 1)
    }

    async fn evict(&self, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let (len, ()): (usize, ()) = redis::pipe()
            .atomic()
            .llen(&self.key)
            .ltrim(&self.key, n as isize, -1)
            .query_async(&mut conn)
            .await?;
        Ok(n.min(len))
    }

    async fn all_timestamps(&self) -> Result<Vec<f64>> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.lrange(&self.key, 0, -1).await?;

        let mut timestamps = raw
            .into_iter()
            .map(|value| {
                value
                    .parse::<f64>()
                    .map_err(|_| LimiterError::CorruptBucket {
                        key: self.key.clone(),
                        value,
                    })
            })
            .collect::<Result<Vec<f64>>>()?;

        if !timestamps.windows(2).all(|w| w[0] <= w[1]) {
            warn!(key = %self.key, "Bucket timestamps out of order, sorting");
            timestamps.sort_by(|a, b| a.total_cmp(b));
        }
        Ok(timestamps)
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }
}
