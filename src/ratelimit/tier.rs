//! Rate tiers: one (limit, interval) enforcement window each.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Named time unit for tier intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    /// Thirty days.
    Month,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86_400),
            TimeUnit::Month => Duration::from_secs(86_400 * 30),
        }
    }
}

/// A single enforcement rule: at most `limit` admissions per `interval`.
///
/// Immutable once built; the only way to get one is through [`RateTier::new`]
/// or [`RateTier::per`], both of which reject zero limits and intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateTier {
    limit: u32,
    interval: Duration,
}

impl RateTier {
    /// Create a tier allowing `limit` admissions per `interval`.
    pub fn new(limit: u32, interval: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(LimiterError::Config(
                "tier limit must be greater than zero".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(LimiterError::Config(
                "tier interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self { limit, interval })
    }

    /// Create a tier allowing `limit` admissions per one `unit`.
    pub fn per(limit: u32, unit: TimeUnit) -> Result<Self> {
        Self::new(limit, unit.duration())
    }

    /// Create a tier from a fractional number of seconds.
    pub fn from_secs_f64(limit: u32, interval_secs: f64) -> Result<Self> {
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            return Err(LimiterError::Config(format!(
                "tier interval must be a positive number of seconds, got {}",
                interval_secs
            )));
        }
        Self::new(limit, Duration::from_secs_f64(interval_secs))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Interval in seconds, the unit bucket timestamps are kept in.
    pub fn interval_secs(&self) -> f64 {
        self.interval.as_secs_f64()
    }
}

impl fmt::Display for RateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.limit, self.interval.as_secs_f64())
    }
}

/// Check that a tier list is usable by a limiter.
///
/// The list must be non-empty and strictly increasing in both limit and
/// interval.
pub fn validate_tiers(tiers: &[RateTier]) -> Result<()> {
    if tiers.is_empty() {
        return Err(LimiterError::Config(
            "at least one rate tier must be provided".to_string(),
        ));
    }

    for pair in tiers.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.limit <= prev.limit || next.interval <= prev.interval {
            return Err(LimiterError::Config(format!(
                "{} cannot come before {}",
                prev, next
            )));
        }
    }

    Ok(())
}
