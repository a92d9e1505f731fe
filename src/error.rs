//! Error types for tiergate.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::RateTier;

/// Main error type for admission operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Malformed tier list or settings. Raised at construction only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller exceeded one of the configured tiers.
    #[error("Too many requests: {0}")]
    TooManyRequests(Rejection),

    /// The backing store could not be reached or refused the command.
    #[error("Store unavailable: {0}")]
    Store(#[from] redis::RedisError),

    /// A bucket held a value that is not a timestamp.
    #[error("Corrupt bucket {key}: {value:?} is not a timestamp")]
    CorruptBucket { key: String, value: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// The rejection carried by this error, if it is one.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            LimiterError::TooManyRequests(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Whether the error is a capacity rejection rather than a failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, LimiterError::TooManyRequests(_))
    }

    /// Whether the error came from the backing store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, LimiterError::Store(_))
    }
}

/// Result type alias for tiergate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// A denied admission.
///
/// Built fresh for every failed attempt; holds the identity that hit its cap,
/// the tier it hit, and how long until the oldest blocking entry leaves the
/// window.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    identity: String,
    tier: RateTier,
    remaining: Duration,
}

impl Rejection {
    /// Create a rejection. Negative or non-finite waits clamp to zero.
    pub fn new(identity: impl Into<String>, tier: RateTier, remaining_secs: f64) -> Self {
        let remaining = if remaining_secs.is_finite() && remaining_secs > 0.0 {
            Duration::from_secs_f64(remaining_secs)
        } else {
            Duration::ZERO
        };

        Self {
            identity: identity.into(),
            tier,
            remaining,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn tier(&self) -> RateTier {
        self.tier
    }

    /// Time until the next admission for this identity could succeed.
    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// A serializable view for callers that report rejections outward.
    pub fn report(&self) -> RejectionReport {
        RejectionReport {
            error: self.to_string(),
            identity: self.identity.clone(),
            rate: self.tier.to_string(),
            remaining_secs: self.remaining.as_secs_f64(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bucket for {} with rate {} is already full",
            self.identity, self.tier
        )
    }
}

/// Flat form of a [`Rejection`], suitable for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionReport {
    pub error: String,
    pub identity: String,
    pub rate: String,
    pub remaining_secs: f64,
}
