use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
const DEFAULT_OPEN_DURATION_SECONDS: u64 = 30;
const DEFAULT_PROBE_INTERVAL_SECONDS: u64 = 10;

const DEFAULT_SLIDING_TTL_SECONDS: u64 = 300;
const DEFAULT_MAX_TTL_SECONDS: u64 = 1_800;
const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_AFFINITY_CAPACITY: usize = 10_000;

const DEFAULT_LATENCY_PENALTY_DENOMINATOR_MS: u64 = 500;
const DEFAULT_LATENCY_PENALTY_CAP: f64 = 0.5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid integer in env var {key}: {value}")]
    ParseInt { key: String, value: String },
    #[error("invalid float in env var {key}: {value}")]
    ParseFloat { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-upstream circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_seconds: u64,
    pub probe_interval_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            open_duration_seconds: DEFAULT_OPEN_DURATION_SECONDS,
            probe_interval_seconds: DEFAULT_PROBE_INTERVAL_SECONDS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }
}

/// Partial breaker config stored on an upstream row; merged over defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_interval_seconds: Option<u64>,
}

impl CircuitBreakerOverride {
    pub fn merged_over(&self, defaults: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
            open_duration_seconds: self
                .open_duration_seconds
                .unwrap_or(defaults.open_duration_seconds),
            probe_interval_seconds: self
                .probe_interval_seconds
                .unwrap_or(defaults.probe_interval_seconds),
        }
    }
}

/// Session affinity store tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityConfig {
    pub sliding_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub capacity: usize,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            sliding_ttl_seconds: DEFAULT_SLIDING_TTL_SECONDS,
            max_ttl_seconds: DEFAULT_MAX_TTL_SECONDS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECONDS,
            capacity: DEFAULT_AFFINITY_CAPACITY,
        }
    }
}

impl AffinityConfig {
    pub fn sliding_ttl(&self) -> Duration {
        Duration::from_secs(self.sliding_ttl_seconds)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Weighted-selection tuning: how hard observed latency discounts a
/// candidate's weight within its tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub latency_penalty_denominator_ms: u64,
    pub latency_penalty_cap: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            latency_penalty_denominator_ms: DEFAULT_LATENCY_PENALTY_DENOMINATOR_MS,
            latency_penalty_cap: DEFAULT_LATENCY_PENALTY_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub breaker: CircuitBreakerConfig,
    pub affinity: AffinityConfig,
    pub selector: SelectorConfig,
}

impl RoutingConfig {
    /// Defaults overridable through `MODELMUX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.breaker.failure_threshold = parse_u32_env(
            "MODELMUX_CIRCUIT_FAILURE_THRESHOLD",
            config.breaker.failure_threshold,
        )?;
        config.breaker.success_threshold = parse_u32_env(
            "MODELMUX_CIRCUIT_SUCCESS_THRESHOLD",
            config.breaker.success_threshold,
        )?;
        config.breaker.open_duration_seconds = parse_u64_env(
            "MODELMUX_CIRCUIT_OPEN_DURATION_SECONDS",
            config.breaker.open_duration_seconds,
        )?;
        config.breaker.probe_interval_seconds = parse_u64_env(
            "MODELMUX_CIRCUIT_PROBE_INTERVAL_SECONDS",
            config.breaker.probe_interval_seconds,
        )?;
        config.affinity.sliding_ttl_seconds = parse_u64_env(
            "MODELMUX_AFFINITY_SLIDING_TTL_SECONDS",
            config.affinity.sliding_ttl_seconds,
        )?;
        config.affinity.max_ttl_seconds = parse_u64_env(
            "MODELMUX_AFFINITY_MAX_TTL_SECONDS",
            config.affinity.max_ttl_seconds,
        )?;
        config.affinity.cleanup_interval_seconds = parse_u64_env(
            "MODELMUX_AFFINITY_CLEANUP_INTERVAL_SECONDS",
            config.affinity.cleanup_interval_seconds,
        )?;
        config.affinity.capacity =
            parse_usize_env("MODELMUX_AFFINITY_CAPACITY", config.affinity.capacity)?;
        config.selector.latency_penalty_denominator_ms = parse_u64_env(
            "MODELMUX_LATENCY_PENALTY_DENOMINATOR_MS",
            config.selector.latency_penalty_denominator_ms,
        )?;
        config.selector.latency_penalty_cap = parse_f64_env(
            "MODELMUX_LATENCY_PENALTY_CAP",
            config.selector.latency_penalty_cap,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "MODELMUX_CIRCUIT_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "MODELMUX_CIRCUIT_SUCCESS_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.breaker.open_duration_seconds == 0 {
            return Err(ConfigError::Invalid(
                "MODELMUX_CIRCUIT_OPEN_DURATION_SECONDS must be greater than 0".to_string(),
            ));
        }
        if self.affinity.sliding_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "MODELMUX_AFFINITY_SLIDING_TTL_SECONDS must be greater than 0".to_string(),
            ));
        }
        if self.affinity.max_ttl_seconds < self.affinity.sliding_ttl_seconds {
            return Err(ConfigError::Invalid(
                "MODELMUX_AFFINITY_MAX_TTL_SECONDS must not be below the sliding TTL".to_string(),
            ));
        }
        if self.affinity.capacity == 0 {
            return Err(ConfigError::Invalid(
                "MODELMUX_AFFINITY_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.selector.latency_penalty_denominator_ms == 0 {
            return Err(ConfigError::Invalid(
                "MODELMUX_LATENCY_PENALTY_DENOMINATOR_MS must be greater than 0".to_string(),
            ));
        }
        if !self.selector.latency_penalty_cap.is_finite()
            || self.selector.latency_penalty_cap <= 0.0
            || self.selector.latency_penalty_cap > 1.0
        {
            return Err(ConfigError::Invalid(
                "MODELMUX_LATENCY_PENALTY_CAP must be a finite value in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn optional_trimmed_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value.parse::<u64>().map_err(|_| ConfigError::ParseInt {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_u32_env(key: &str, default: u32) -> Result<u32, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value.parse::<u32>().map_err(|_| ConfigError::ParseInt {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_usize_env(key: &str, default: usize) -> Result<usize, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value.parse::<usize>().map_err(|_| ConfigError::ParseInt {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_f64_env(key: &str, default: f64) -> Result<f64, ConfigError> {
    match optional_trimmed_env(key) {
        Some(value) => value.parse::<f64>().map_err(|_| ConfigError::ParseFloat {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_merges_over_defaults() {
        let defaults = CircuitBreakerConfig::default();
        let over = CircuitBreakerOverride {
            failure_threshold: Some(1),
            open_duration_seconds: Some(5),
            ..Default::default()
        };
        let merged = over.merged_over(&defaults);
        assert_eq!(merged.failure_threshold, 1);
        assert_eq!(merged.open_duration_seconds, 5);
        assert_eq!(merged.success_threshold, defaults.success_threshold);
        assert_eq!(
            merged.probe_interval_seconds,
            defaults.probe_interval_seconds
        );
    }

    #[test]
    fn validate_rejects_inverted_ttls() {
        let mut config = RoutingConfig::default();
        config.affinity.max_ttl_seconds = 10;
        config.affinity.sliding_ttl_seconds = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(RoutingConfig::default().validate().is_ok());
    }
}
