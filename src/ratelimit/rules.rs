//! Rate tier rules as written in configuration.
//!
//! A rule names its interval either as a count of [`TimeUnit`]s or as a raw
//! number of seconds:
//!
//! ```yaml
//! - limit: 5
//!   unit: second
//! - limit: 100
//!   unit: minute
//!   units: 15
//! - limit: 2
//!   interval_secs: 0.5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::tier::{validate_tiers, RateTier, TimeUnit};
use crate::error::{LimiterError, Result};

/// One configured tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    /// Admissions allowed per interval
    pub limit: u32,
    /// Named interval unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TimeUnit>,
    /// How many `unit`s make up the interval (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<u32>,
    /// Interval in seconds, as an alternative to `unit`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<f64>,
    /// Optional label for logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TierRule {
    /// A rule of `limit` per one `unit`.
    pub fn per(limit: u32, unit: TimeUnit) -> Self {
        Self {
            limit,
            unit: Some(unit),
            units: None,
            interval_secs: None,
            name: None,
        }
    }

    /// Resolve the rule into a tier.
    pub fn to_tier(&self) -> Result<RateTier> {
        match (self.unit, self.interval_secs) {
            (Some(unit), None) => {
                let units = self.units.unwrap_or(1);
                if units == 0 {
                    return Err(LimiterError::Config(format!(
                        "tier {}: units must be greater than zero",
                        self.label()
                    )));
                }
                RateTier::new(self.limit, unit.duration() * units)
            }
            (None, Some(secs)) => {
                if self.units.is_some() {
                    return Err(LimiterError::Config(format!(
                        "tier {}: units requires unit",
                        self.label()
                    )));
                }
                RateTier::from_secs_f64(self.limit, secs)
            }
            (Some(_), Some(_)) => Err(LimiterError::Config(format!(
                "tier {}: set either unit or interval_secs, not both",
                self.label()
            ))),
            (None, None) => Err(LimiterError::Config(format!(
                "tier {}: an interval (unit or interval_secs) is required",
                self.label()
            ))),
        }
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("with limit {}", self.limit))
    }

    /// Resolve and validate an ordered list of rules.
    pub fn to_tiers(rules: &[TierRule]) -> Result<Vec<RateTier>> {
        let tiers = rules
            .iter()
            .map(TierRule::to_tier)
            .collect::<Result<Vec<_>>>()?;
        validate_tiers(&tiers)?;
        Ok(tiers)
    }

    /// Load a list of rules from a YAML string.
    pub fn list_from_yaml(yaml: &str) -> Result<Vec<TierRule>> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse tier rules: {}", e)))
    }

    /// Load a list of rules from a YAML file.
    pub fn list_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<TierRule>> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier rules");

        let contents = std::fs::read_to_string(path)?;
        Self::list_from_yaml(&contents)
    }
}
