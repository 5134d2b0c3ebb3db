//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

use std::{fmt, net::SocketAddr, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use uavfed_core::settings::{EvaluationSettings, ModelSettings};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::coordinator::RoundParams;

#[cfg(test)]
mod tests;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("uavfed").separator("__"))?;
        config.try_into()
    }
}

fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.evaluation.validate_evaluation()
}

#[derive(Debug, Clone, Deserialize)]
/// Network settings of the coordinator.
pub struct ApiSettings {
    /// The address to which the coordinator's UDP socket should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:5000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_API__BIND_ADDRESS=0.0.0.0:5000
    /// ```
    pub bind_address: SocketAddr,

    /// The wildcard destination used to reach the workers while no worker is registered yet.
    /// Usually the broadcast address of the network and the port the workers listen on. Without
    /// it, rounds started before the first worker registered only reach workers that submit on
    /// their own.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// broadcast_address = "255.255.255.255:5001"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_API__BROADCAST_ADDRESS=255.255.255.255:5001
    /// ```
    #[serde(default)]
    pub broadcast_address: Option<SocketAddr>,
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_round"))]
/// Round settings. All times are in milliseconds.
pub struct RoundSettings {
    /// The delay before the first round starts.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// start_time_ms = 1000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_ROUND__START_TIME_MS=1000
    /// ```
    #[serde(default)]
    pub start_time_ms: u64,

    /// The time between the start of a round and the first aggregation attempt. Aggregation
    /// attempts that miss the quorum are retried after half of this interval.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// aggregation_interval_ms = 10000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_ROUND__AGGREGATION_INTERVAL_MS=10000
    /// ```
    pub aggregation_interval_ms: u64,

    /// The time between a successful aggregation and the start of the next round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// round_interval_ms = 30000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_ROUND__ROUND_INTERVAL_MS=30000
    /// ```
    pub round_interval_ms: u64,

    /// The grace delay of the aggregation once `total_clients` clients have submitted.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// early_aggregation_delay_ms = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_ROUND__EARLY_AGGREGATION_DELAY_MS=100
    /// ```
    #[serde(default = "default_early_aggregation_delay_ms")]
    pub early_aggregation_delay_ms: u64,

    /// The minimal number of distinct clients whose updates are needed to aggregate. Must be
    /// greater or equal to `1` and lower or equal to `total_clients`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// min_updates = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_ROUND__MIN_UPDATES=2
    /// ```
    pub min_updates: usize,

    /// The number of clients expected to take part in a round. Once all of them submitted, the
    /// aggregation takes place after `early_aggregation_delay_ms`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// total_clients = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_ROUND__TOTAL_CLIENTS=3
    /// ```
    pub total_clients: usize,
}

fn default_early_aggregation_delay_ms() -> u64 {
    100
}

impl RoundSettings {
    fn validate_round(&self) -> Result<(), ValidationError> {
        self.validate_intervals()?;
        self.validate_counts()
    }

    fn validate_intervals(&self) -> Result<(), ValidationError> {
        // a half interval of zero would make the quorum retry spin
        if self.aggregation_interval_ms >= 2 && self.round_interval_ms > 0 {
            Ok(())
        } else {
            Err(ValidationError::new("invalid round intervals"))
        }
    }

    fn validate_counts(&self) -> Result<(), ValidationError> {
        if 1 <= self.min_updates && self.min_updates <= self.total_clients {
            Ok(())
        } else {
            Err(ValidationError::new("invalid update counts"))
        }
    }

    pub fn params(&self) -> RoundParams {
        RoundParams {
            start_time: Duration::from_millis(self.start_time_ms),
            aggregation_interval: Duration::from_millis(self.aggregation_interval_ms),
            round_interval: Duration::from_millis(self.round_interval_ms),
            early_aggregation_delay: Duration::from_millis(self.early_aggregation_delay_ms),
            min_updates: self.min_updates,
            total_clients: self.total_clients,
        }
    }
}

fn validate_round(s: &RoundSettings) -> Result<(), ValidationError> {
    s.validate_round()
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
