// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use crate::windowed_buffer::DrainBackoff;
use crate::worker::{WorkerConfig, DEFAULT_BATCH_SIZE};
use std::env;
use std::time::Duration;

/// Configuration of the aggregation pipeline and the process hosting it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Active window size that triggers an inline flush
    pub batch_size: usize,
    /// Period of the forced persistence pass, in seconds
    pub persistent_period_secs: u64,
    /// Upper bound of the drain back-off sleep, in milliseconds
    pub drain_poll_max_ms: u64,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Address this instance registers in the cluster
    pub host: String,
    pub port: u16,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            persistent_period_secs: 3,
            drain_poll_max_ms: 10,
            log_level: "info".to_string(),
            host: "0.0.0.0".to_string(),
            port: 11800,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

impl AnalysisConfig {
    /// Create configuration from `OAP_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            batch_size: parse_or(lookup("OAP_BATCH_SIZE"), "OAP_BATCH_SIZE", defaults.batch_size)?,
            persistent_period_secs: parse_or(
                lookup("OAP_PERSISTENT_PERIOD_SECS"),
                "OAP_PERSISTENT_PERIOD_SECS",
                defaults.persistent_period_secs,
            )?,
            drain_poll_max_ms: parse_or(
                lookup("OAP_DRAIN_POLL_MAX_MS"),
                "OAP_DRAIN_POLL_MAX_MS",
                defaults.drain_poll_max_ms,
            )?,
            log_level: lookup("OAP_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            host: lookup("OAP_HOST").unwrap_or(defaults.host),
            port: parse_or(lookup("OAP_PORT"), "OAP_PORT", defaults.port)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch size must be greater than 0".to_string(),
            ));
        }

        if self.persistent_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "persistent period must be greater than 0".to_string(),
            ));
        }

        if self.drain_poll_max_ms == 0 {
            return Err(ConfigError::Invalid(
                "drain poll maximum must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("OAP_HOST cannot be empty".to_string()));
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "port must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn persistent_period(&self) -> Duration {
        Duration::from_secs(self.persistent_period_secs)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let max = Duration::from_millis(self.drain_poll_max_ms);
        let defaults = DrainBackoff::default();
        WorkerConfig {
            batch_size: self.batch_size,
            drain_backoff: DrainBackoff {
                initial: defaults.initial.min(max),
                max,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_lookup_yields_defaults() {
        let config = AnalysisConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AnalysisConfig::default());
    }

    #[test]
    fn test_values_are_read_and_normalized() {
        let config = AnalysisConfig::from_lookup(lookup(&[
            ("OAP_BATCH_SIZE", "250"),
            ("OAP_PERSISTENT_PERIOD_SECS", " 5 "),
            ("OAP_LOG_LEVEL", "DEBUG"),
            ("OAP_HOST", "10.0.0.7"),
            ("OAP_PORT", "12800"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.persistent_period(), Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.port, 12800);
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let err = AnalysisConfig::from_lookup(lookup(&[("OAP_BATCH_SIZE", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid("OAP_BATCH_SIZE has an invalid value 'lots'".to_string())
        );
    }

    #[test]
    fn test_validate_zero_values() {
        for config in [
            AnalysisConfig {
                batch_size: 0,
                ..Default::default()
            },
            AnalysisConfig {
                persistent_period_secs: 0,
                ..Default::default()
            },
            AnalysisConfig {
                drain_poll_max_ms: 0,
                ..Default::default()
            },
            AnalysisConfig {
                port: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be invalid");
        }
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = AnalysisConfig {
            log_level: "invalid".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_config_caps_backoff() {
        let config = AnalysisConfig {
            batch_size: 42,
            drain_poll_max_ms: 1,
            ..Default::default()
        };
        let worker = config.worker_config();
        assert_eq!(worker.batch_size, 42);
        assert_eq!(worker.drain_backoff.max, Duration::from_millis(1));
        assert_eq!(worker.drain_backoff.initial, Duration::from_micros(10));
    }
}
