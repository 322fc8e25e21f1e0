//! Issuer configuration.
//!
//! Every section has defaults, so a config file only needs the values it
//! changes.

use crate::types::ChainKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level issuer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Shown in logs; the certificate issuer itself comes from the template.
    pub issuer_name: String,
    pub chain: ChainKind,
    pub pipeline: PipelineConfig,
    pub anchor: AnchorConfig,
}

impl IssuerConfig {
    /// Load from JSON, filling unspecified values with defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: IssuerConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fee = &self.anchor.fee;
        if fee.min_sat_per_vb <= 0.0 || fee.min_sat_per_vb > fee.max_sat_per_vb {
            return Err(ConfigError::Invalid(format!(
                "fee bounds must satisfy 0 < min ({}) <= max ({})",
                fee.min_sat_per_vb, fee.max_sat_per_vb
            )));
        }
        if self.anchor.max_broadcast_attempts == 0 {
            return Err(ConfigError::Invalid("max_broadcast_attempts must be at least 1".into()));
        }
        if self.anchor.confirmation.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Issue the remaining certificates when some fail assembly.
    pub allow_partial_batch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Transmission attempts per broadcast (first try included).
    pub max_broadcast_attempts: u32,
    /// Base delay between attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    pub fee: FeePolicy,
    pub confirmation: ConfirmationPolicy,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            max_broadcast_attempts: 3,
            retry_backoff_ms: 500,
            fee: FeePolicy::default(),
            confirmation: ConfirmationPolicy::default(),
        }
    }
}

impl AnchorConfig {
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Bounds applied to the network's fee estimate (sat/vB).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    pub min_sat_per_vb: f64,
    pub max_sat_per_vb: f64,
    /// Used when the estimate cannot be fetched.
    pub fallback_sat_per_vb: f64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            min_sat_per_vb: 1.0,
            max_sat_per_vb: 500.0,
            fallback_sat_per_vb: 10.0,
        }
    }
}

impl FeePolicy {
    /// Bound `rate` to the policy; non-finite estimates use the fallback.
    ///
    /// Never panics, even for a policy `validate` would reject: the upper
    /// bound wins when the bounds are inverted.
    pub fn clamp(&self, rate: f64) -> f64 {
        let rate = if rate.is_finite() { rate } else { self.fallback_sat_per_vb };
        rate.max(self.min_sat_per_vb).min(self.max_sat_per_vb)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationPolicy {
    pub required_confirmations: u64,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            required_confirmations: 1,
            poll_interval_secs: 30,
            timeout_secs: 3600,
        }
    }
}

impl ConfirmationPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
