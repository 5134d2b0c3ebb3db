//! Loading and validation of the worker settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{fmt, net::SocketAddr, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use uavfed_core::{
    message::ClientId,
    settings::{EvaluationSettings, ModelSettings},
};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::worker::{SensorSampler, WorkerParams};

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
    pub client: ClientSettings,
    #[validate]
    pub sensor: SensorSettings,
    #[validate]
    pub training: TrainingSettings,
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

    /// Combines the worker related sections.
    pub fn params(&self) -> WorkerParams {
        WorkerParams {
            client_id: self.client.id,
            start_time: Duration::from_millis(self.sensor.start_time_ms),
            sensor_interval: Duration::from_millis(self.sensor.interval_ms),
            training_interval: Duration::from_millis(self.training.interval_ms),
            dispatch_delay: Duration::from_millis(self.training.dispatch_delay_ms),
            data_collection_size: self.sensor.data_collection_size,
            report_sensor_data: self.sensor.report,
        }
    }
}

fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.evaluation.validate_evaluation()
}

#[derive(Debug, Clone, Deserialize)]
/// Identity and network settings of the worker.
pub struct ClientSettings {
    /// The identifier of the worker. Must be unique among the workers of a coordinator.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// id = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_CLIENT__ID=1
    /// ```
    pub id: ClientId,

    /// The address to which the worker's UDP socket should be bound. The coordinator's round
    /// announcements and global models arrive on it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// bind_address = "0.0.0.0:5001"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_CLIENT__BIND_ADDRESS=0.0.0.0:5001
    /// ```
    pub bind_address: SocketAddr,

    /// Candidate addresses of the coordinator as `host:port`. The first one that resolves is
    /// used. If none resolves, the worker doesn't send anything.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// destination_addresses = ["base-station:5000", "10.0.0.1:5000"]
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_CLIENT__DESTINATION_ADDRESSES=10.0.0.1:5000
    /// ```
    #[serde(deserialize_with = "deserialize_addresses")]
    pub destination_addresses: Vec<String>,
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_sensor"))]
/// Sensor settings. All times are in milliseconds.
pub struct SensorSettings {
    /// The delay before the first sensor reading.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sensor]
    /// start_time_ms = 1000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_SENSOR__START_TIME_MS=1000
    /// ```
    #[serde(default)]
    pub start_time_ms: u64,

    /// The time between two sensor readings.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sensor]
    /// interval_ms = 1000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_SENSOR__INTERVAL_MS=1000
    /// ```
    pub interval_ms: u64,

    /// The number of buffered samples that triggers a local training. Must be greater or equal
    /// to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sensor]
    /// data_collection_size = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_SENSOR__DATA_COLLECTION_SIZE=5
    /// ```
    pub data_collection_size: usize,

    /// The number of features of a sample.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sensor]
    /// feature_count = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_SENSOR__FEATURE_COUNT=10
    /// ```
    #[serde(default = "default_feature_count")]
    pub feature_count: usize,

    /// Whether each sensor reading is reported to the coordinator.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sensor]
    /// report = false
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_SENSOR__REPORT=false
    /// ```
    #[serde(default = "default_report")]
    pub report: bool,

    /// The seed of the sensor readings. Seeded from entropy if missing.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sensor]
    /// seed = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_SENSOR__SEED=3
    /// ```
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_feature_count() -> usize {
    10
}

fn default_report() -> bool {
    true
}

impl SensorSettings {
    fn validate_sensor(&self) -> Result<(), ValidationError> {
        if self.interval_ms == 0 {
            return Err(ValidationError::new("invalid sensor interval"));
        }
        if self.data_collection_size == 0 {
            return Err(ValidationError::new("invalid data collection size"));
        }
        if self.feature_count == 0 {
            return Err(ValidationError::new("invalid feature count"));
        }
        Ok(())
    }

    pub fn sampler(&self) -> SensorSampler {
        SensorSampler::new(self.feature_count, self.seed)
    }
}

fn validate_sensor(s: &SensorSettings) -> Result<(), ValidationError> {
    s.validate_sensor()
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_training"))]
/// Training settings. All times are in milliseconds.
pub struct TrainingSettings {
    /// The delay of the local training after a global model was received.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// interval_ms = 5000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_TRAINING__INTERVAL_MS=5000
    /// ```
    pub interval_ms: u64,

    /// The delay of the local training after a round start or once enough samples are
    /// buffered.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// dispatch_delay_ms = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UAVFED_TRAINING__DISPATCH_DELAY_MS=10
    /// ```
    #[serde(default = "default_dispatch_delay_ms")]
    pub dispatch_delay_ms: u64,
}

fn default_dispatch_delay_ms() -> u64 {
    10
}

impl TrainingSettings {
    fn validate_training(&self) -> Result<(), ValidationError> {
        if self.interval_ms > 0 {
            Ok(())
        } else {
            Err(ValidationError::new("invalid training interval"))
        }
    }
}

fn validate_training(s: &TrainingSettings) -> Result<(), ValidationError> {
    s.validate_training()
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

/// Accepts a list of addresses, or a single comma-separated string as it comes from an
/// environment variable.
fn deserialize_addresses<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Addresses {
        List(Vec<String>),
        Joined(String),
    }

    let addresses = match Addresses::deserialize(deserializer)? {
        Addresses::List(list) => list,
        Addresses::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .map(String::from)
            .collect(),
    };
    Ok(addresses)
}
