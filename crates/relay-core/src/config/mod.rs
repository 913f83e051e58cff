//! Consumer configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Later sources override earlier ones:
//!
//! 1. **Compiled defaults**: the `Default` implementations below
//! 2. **Config file**: TOML file named by `RELAY_CONFIG` (default `config/consumer.toml`)
//! 3. **Environment variables**: `RELAY__*` variables, `__` separating nested fields
//!
//! # Configuration Sections
//!
//! - [`SessionsConfig`]: session limits, connection and probe tunables, QoS constants
//! - [`OptimizerConfig`]: provider scoring and selection strategy
//! - [`LoggingConfig`]: log level and format
//!
//! # Example
//!
//! ```toml
//! [sessions]
//! max_sessions_per_provider = 500
//! probe_timeout_ms = 250
//!
//! [optimizer]
//! strategy = "latency"
//! ```

use crate::{optimizer::OptimizerConfig, session::QosParameters};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

pub use ::config::ConfigError;

/// Session manager tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Failed dials after which an endpoint is disabled for the epoch. Also the
    /// disconnection count reported for a provider whose endpoints all failed.
    #[serde(default = "default_max_consecutive_connection_attempts")]
    pub max_consecutive_connection_attempts: u64,

    /// Sessions a single provider may hold.
    #[serde(default = "default_max_sessions_per_provider")]
    pub max_sessions_per_provider: usize,

    /// Block-listed sessions tolerated per endpoint before the provider is blocked.
    /// Scaled by `number_of_resets + 1`.
    #[serde(default = "default_max_block_listed_sessions_per_provider")]
    pub max_block_listed_sessions_per_provider: u64,

    /// Consecutive failures after which a session is block-listed.
    #[serde(default = "default_max_failures_per_session")]
    pub max_failures_per_session: u64,

    /// Relative noise added to optimizer scores.
    #[serde(default = "default_optimizer_perturbation")]
    pub optimizer_perturbation: f64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-provider probe deadline.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Deadline for the whole epoch probe batch.
    #[serde(default = "default_probe_batch_timeout_ms")]
    pub probe_batch_timeout_ms: u64,

    /// Upper bound of the random delay before the epoch probe batch starts.
    #[serde(default = "default_probe_jitter_max_ms")]
    pub probe_jitter_max_ms: u64,

    #[serde(default = "default_true")]
    pub probe_on_epoch_update: bool,

    /// Block and report a provider whose session was block-listed before it
    /// committed any compute units this epoch.
    #[serde(default = "default_true")]
    pub block_provider_without_successful_cu: bool,

    /// Gap between expected and served block above which a warning is logged.
    #[serde(default = "default_block_gap_warning_threshold")]
    pub block_gap_warning_threshold: i64,

    #[serde(default = "default_percentile_to_calculate_latency")]
    pub percentile_to_calculate_latency: f64,

    #[serde(default = "default_min_providers_for_sync")]
    pub min_providers_for_sync: f64,

    #[serde(default = "default_availability_percentage")]
    pub availability_percentage: f64,

    /// Age of a report before its provider is retried.
    #[serde(default = "default_reconnect_candidate_seconds")]
    pub reconnect_candidate_seconds: u64,

    /// Period of the reported-provider reconnect loop.
    #[serde(default = "default_reconnect_interval_seconds")]
    pub reconnect_interval_seconds: u64,
}

fn default_max_consecutive_connection_attempts() -> u64 {
    5
}
fn default_max_sessions_per_provider() -> usize {
    1000
}
fn default_max_block_listed_sessions_per_provider() -> u64 {
    3
}
fn default_max_failures_per_session() -> u64 {
    3
}
fn default_optimizer_perturbation() -> f64 {
    0.10
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    300
}
fn default_probe_batch_timeout_ms() -> u64 {
    5000
}
fn default_probe_jitter_max_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_block_gap_warning_threshold() -> i64 {
    1000
}
fn default_percentile_to_calculate_latency() -> f64 {
    0.9
}
fn default_min_providers_for_sync() -> f64 {
    0.6
}
fn default_availability_percentage() -> f64 {
    0.1
}
fn default_reconnect_candidate_seconds() -> u64 {
    120
}
fn default_reconnect_interval_seconds() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_consecutive_connection_attempts: 5,
            max_sessions_per_provider: 1000,
            max_block_listed_sessions_per_provider: 3,
            max_failures_per_session: 3,
            optimizer_perturbation: 0.10,
            connect_timeout_ms: 1000,
            probe_timeout_ms: 300,
            probe_batch_timeout_ms: 5000,
            probe_jitter_max_ms: 500,
            probe_on_epoch_update: true,
            block_provider_without_successful_cu: true,
            block_gap_warning_threshold: 1000,
            percentile_to_calculate_latency: 0.9,
            min_providers_for_sync: 0.6,
            availability_percentage: 0.1,
            reconnect_candidate_seconds: 120,
            reconnect_interval_seconds: 60,
        }
    }
}

impl SessionsConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn probe_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_batch_timeout_ms)
    }

    #[must_use]
    pub fn reconnect_candidate_after(&self) -> Duration {
        Duration::from_secs(self.reconnect_candidate_seconds)
    }

    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }

    #[must_use]
    pub fn qos_parameters(&self) -> QosParameters {
        QosParameters {
            percentile: self.percentile_to_calculate_latency,
            min_providers_for_sync: self.min_providers_for_sync,
            availability_percentage: self.availability_percentage,
        }
    }

    /// Validates the session tunables.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if a value is out of range.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_consecutive_connection_attempts == 0 {
            return Err("max_consecutive_connection_attempts must be greater than 0".to_string());
        }
        if self.max_sessions_per_provider == 0 {
            return Err("max_sessions_per_provider must be greater than 0".to_string());
        }
        if self.max_block_listed_sessions_per_provider == 0 {
            return Err("max_block_listed_sessions_per_provider must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer_perturbation) {
            return Err("optimizer_perturbation must be in [0, 1)".to_string());
        }
        if self.connect_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err("connect and probe timeouts must be greater than 0".to_string());
        }
        if self.probe_batch_timeout_ms < self.probe_timeout_ms {
            return Err("probe_batch_timeout_ms must not be shorter than probe_timeout_ms".to_string());
        }
        if !(0.0..1.0).contains(&self.percentile_to_calculate_latency) {
            return Err("percentile_to_calculate_latency must be in [0, 1)".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_providers_for_sync) {
            return Err("min_providers_for_sync must be in [0, 1]".to_string());
        }
        if self.availability_percentage <= 0.0 || self.availability_percentage > 1.0 {
            return Err("availability_percentage must be in (0, 1]".to_string());
        }
        if self.reconnect_interval_seconds == 0 {
            return Err("reconnect_interval_seconds must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `"info"` or `"relay_core=debug"`.
    pub level: String,
    /// `"json"` or `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Root consumer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConsumerConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Use `__` as a separator for nested fields, e.g.
    /// `RELAY__SESSIONS__PROBE_TIMEOUT_MS=500`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("RELAY").separator("__"))
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/consumer.toml`, overridable through `RELAY_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("RELAY_CONFIG").unwrap_or_else(|_| "config/consumer.toml".to_string());
        Self::from_file(&config_path)
    }

    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        self.sessions.validate()?;

        if self.optimizer.latency_window == 0 {
            return Err("optimizer.latency_window must be greater than 0".to_string());
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
