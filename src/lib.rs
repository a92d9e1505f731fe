//! Tiergate - tiered sliding-window admission control
//!
//! This crate bounds how often a caller (a user, an IP, any key) may proceed
//! past a guarded operation. Several rate tiers are enforced at once against a
//! per-identity log of admission timestamps kept in a shared store, so every
//! process pointed at the same Redis enforces one set of limits.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{LimiterError, Rejection, Result};
pub use ratelimit::{AdmissionGuard, Limiter, RateTier};
