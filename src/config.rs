//! Configuration management for tiergate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    AdmissionGuard, BucketStore, Limiter, MemoryStore, RateTier, RedisStore, RedisStoreConfig,
    TierRule, TimeUnit, DEFAULT_CONNECT_RETRIES, DEFAULT_NAMESPACE, DEFAULT_TIMEOUT,
};

/// Prefix for environment overrides, e.g. `TIERGATE__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "TIERGATE";

/// Main configuration for tiergate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Tier and guard configuration
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// File the configuration was read from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Which store holds bucket histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only limiters in the same process share state
    #[default]
    Memory,
    /// Shared across every process using the same Redis and namespace
    Redis,
}

impl StoreBackend {
    /// Whether history outlives the process and is seen by other processes.
    pub fn is_shared(&self) -> bool {
        matches!(self, StoreBackend::Redis)
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key namespace; buckets are stored as `{namespace}___{identity}`
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Expire idle buckets after this many seconds
    #[serde(default)]
    pub bucket_ttl_secs: Option<u64>,

    /// Bound on connecting to Redis and on each command, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Reconnect attempts before a Redis connection error is reported
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            namespace: default_namespace(),
            bucket_ttl_secs: None,
            timeout_ms: default_timeout_ms(),
            connect_retries: default_connect_retries(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_connect_retries() -> usize {
    DEFAULT_CONNECT_RETRIES
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Tier and guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Tiers, loosest first
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierRule>,

    /// Wait out rejections instead of failing immediately
    #[serde(default)]
    pub delay: bool,

    /// Longest single wait when delaying; unset or zero means unbounded
    #[serde(default)]
    pub max_delay_secs: Option<f64>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            delay: false,
            max_delay_secs: None,
        }
    }
}

fn default_tiers() -> Vec<TierRule> {
    vec![
        TierRule::per(10, TimeUnit::Second),
        TierRule::per(300, TimeUnit::Minute),
    ]
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| LimiterError::Config(e.to_string()))?;
        config.source = Some(PathBuf::from(path));
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then `TIERGATE__*`
    /// environment variables (highest priority).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let mut config: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.source = path.map(Path::to_path_buf);

        config.validate()?;
        Ok(config)
    }

    /// Check every setting that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        self.tiers()?;

        if self.store.namespace.is_empty() {
            return Err(LimiterError::Config(
                "store.namespace must not be empty".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(LimiterError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.bucket_ttl_secs == Some(0) {
            return Err(LimiterError::Config(
                "store.bucket_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(max) = self.limiter.max_delay_secs {
            if !max.is_finite() || max < 0.0 {
                return Err(LimiterError::Config(format!(
                    "limiter.max_delay_secs must be a non-negative number, got {}",
                    max
                )));
            }
        }

        Ok(())
    }

    /// Resolved and validated tiers.
    pub fn tiers(&self) -> Result<Vec<RateTier>> {
        TierRule::to_tiers(&self.limiter.tiers)
    }

    /// Idle bucket TTL.
    pub fn bucket_ttl(&self) -> Option<Duration> {
        self.store.bucket_ttl_secs.map(Duration::from_secs)
    }

    /// Longest single guard wait, if bounded.
    pub fn max_delay(&self) -> Option<Duration> {
        self.limiter
            .max_delay_secs
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Open the configured store.
    pub async fn build_store(&self) -> Result<Arc<dyn BucketStore>> {
        match self.store.backend {
            StoreBackend::Memory => {
                let mut store = MemoryStore::with_namespace(&self.store.namespace);
                if let Some(ttl) = self.bucket_ttl() {
                    store = store.with_ttl(ttl);
                }
                Ok(Arc::new(store))
            }
            StoreBackend::Redis => {
                let store = RedisStore::connect_with_config(
                    &self.store.redis_url,
                    RedisStoreConfig {
                        namespace: self.store.namespace.clone(),
                        ttl: self.bucket_ttl(),
                        timeout: Duration::from_millis(self.store.timeout_ms),
                        connect_retries: self.store.connect_retries,
                    },
                )
                .await?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Open the configured store and build a limiter over it.
    pub async fn build_limiter(&self) -> Result<Arc<Limiter>> {
        let tiers = self.tiers()?;
        let store = self.build_store().await?;
        Ok(Arc::new(Limiter::new(tiers, store)?))
    }

    /// Guard `identities` with the configured delay behaviour.
    pub fn guard<I, S>(&self, limiter: &Arc<Limiter>, identities: I) -> AdmissionGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        limiter.ratelimit(identities, self.limiter.delay, self.max_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.namespace, "tiergate");
        assert_eq!(config.tiers().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://cache:6379/1
  namespace: login
  bucket_ttl_secs: 3600
  timeout_ms: 500
  connect_retries: 0
limiter:
  delay: true
  max_delay_secs: 2.5
  tiers:
    - limit: 5
      unit: second
    - limit: 20
      unit: minute
logging:
  level: debug
  json: true
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.namespace, "login");
        assert_eq!(config.bucket_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(config.store.timeout_ms, 500);
        assert_eq!(config.store.connect_retries, 0);
        assert!(config.store.backend.is_shared());
        assert_eq!(config.max_delay(), Some(Duration::from_millis(2500)));
        assert!(config.limiter.delay);
        assert!(config.logging.json);

        let tiers = config.tiers().unwrap();
        assert_eq!(tiers[1].limit(), 20);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("logging:\n  level: warn\n").unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379/0");
        assert!(!config.limiter.delay);
        assert_eq!(config.store.timeout_ms, 2000);
        assert_eq!(config.store.connect_retries, 2);
        assert!(!config.store.backend.is_shared());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.limiter.tiers.reverse();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.namespace.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.bucket_ttl_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.limiter.max_delay_secs = Some(-1.0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_delay_is_unbounded() {
        let mut config = AppConfig::default();
        config.limiter.max_delay_secs = Some(0.0);
        assert_eq!(config.max_delay(), None);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("tiergate-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "limiter:\n  tiers:\n    - limit: 3\n      interval_secs: 10\n",
        )
        .unwrap();

        let config = AppConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));

        let tiers = config.tiers().unwrap();
        assert_eq!(tiers, vec![RateTier::new(3, Duration::from_secs(10)).unwrap()]);
    }

    #[test]
    fn test_load_records_source() {
        let path = std::env::temp_dir().join(format!("tiergate-load-{}.yaml", std::process::id()));
        std::fs::write(&path, "store:\n  namespace: checkout\n").unwrap();

        let config = AppConfig::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.namespace, "checkout");
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_build_memory_limiter() {
        let config = AppConfig::default();
        let limiter = config.build_limiter().await.unwrap();
        let guard = config.guard(&limiter, ["alice"]);

        guard.acquire().await.unwrap();
        assert_eq!(limiter.current_volume("alice").await.unwrap(), 1);
    }
}
