//! Settings module which allows to manipulate the coordinator from the
//! outside. Configuration is loaded from an optional TOML file, defaults
//! fill in every field, and the result is validated before use.
use std::{fmt, net::SocketAddr, path::Path};

use config::{Config, ConfigError, ValueKind};
use displaydoc::Display;
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

#[derive(Debug, Display, Error)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    /// Loading configuration file failed: {0}.
    Loading(#[from] ConfigError),
    /// Validation failed: {0}.
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
pub struct Settings {
    /// API bind address and worker pool size.
    #[validate]
    pub api: ApiSettings,
    /// Default round parameters applied when a `createRound` call omits them.
    #[validate]
    pub round: RoundDefaults,
    /// Where model blobs and round artifacts are persisted.
    pub storage: StorageSettings,
    /// Security toggles and the metric-sink endpoint.
    pub security: SecuritySettings,
    /// Logging filter.
    pub log: LogSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when loading the configuration file or its validation failed.
    pub fn new(path: Option<impl AsRef<Path>>) -> Result<Self, SettingsError> {
        let settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        match path {
            None => Self::set_default().build()?.try_deserialize(),
            Some(path) => Self::set_default()
                .add_source(config::File::from(path.as_ref()))
                .build()?
                .try_deserialize(),
        }
    }

    fn set_default() -> config::ConfigBuilder<config::builder::DefaultState> {
        Config::builder()
            .set_default("api.bind_address", ValueKind::String("0.0.0.0:8443".to_string()))
            .unwrap_or_default()
            .set_default("api.worker_pool_size", ValueKind::I64(5))
            .unwrap_or_default()
            .set_default("api.request_queue_capacity", ValueKind::I64(64))
            .unwrap_or_default()
            .set_default("api.shutdown_grace_period_seconds", ValueKind::I64(30))
            .unwrap_or_default()
            .set_default("round.min_clients", ValueKind::I64(1))
            .unwrap_or_default()
            .set_default("round.max_clients", ValueKind::I64(10))
            .unwrap_or_default()
            .set_default("round.timeout_seconds", ValueKind::I64(300))
            .unwrap_or_default()
            .set_default("storage.root_dir", ValueKind::String("./data".to_string()))
            .unwrap_or_default()
            .set_default("security.enabled", ValueKind::Boolean(true))
            .unwrap_or_default()
            .set_default("security.metric_sink_endpoint", ValueKind::Nil)
            .unwrap_or_default()
            .set_default("security.client_staleness_seconds", ValueKind::I64(3600))
            .unwrap_or_default()
            .set_default("log.filter", ValueKind::String("mosaic_coordinator=info".to_string()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Bind address and worker pool sizing for `CoordinatorAPI`.
pub struct ApiSettings {
    /// Address the REST API listens on.
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8443"
    /// ```
    pub bind_address: SocketAddr,
    /// Size of the tokio worker pool handling inbound requests.
    #[validate(range(min = 1))]
    pub worker_pool_size: usize,
    /// Maximum number of requests handled concurrently before new ones are
    /// rejected with a retryable error.
    #[validate(range(min = 1))]
    pub request_queue_capacity: usize,
    /// How long `ctrl_c` shutdown waits for in-flight rounds to finalize on
    /// their own before aborting them to `failed`.
    #[validate(range(min = 1))]
    pub shutdown_grace_period_seconds: u64,
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Defaults a `createRound` call falls back to when a field is omitted.
pub struct RoundDefaults {
    #[validate(range(min = 1))]
    pub min_clients: u32,
    pub max_clients: u32,
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
/// Where model blobs and round artifacts are persisted on disk.
pub struct StorageSettings {
    /// Root directory of the `ModelStore` tree.
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// root_dir = "/var/lib/mosaic-coordinator"
    /// ```
    pub root_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
/// Security toggles and the metric-sink endpoint.
pub struct SecuritySettings {
    /// Whether bearer-token authentication is enforced on mutating endpoints.
    pub enabled: bool,
    /// URL metric events are POSTed to; `None` disables `MetricSink` emission.
    pub metric_sink_endpoint: Option<String>,
    /// How long a client may go unseen before the selector treats it as
    /// `inactive`.
    pub client_staleness_seconds: u64,
}

#[derive(Debug, Deserialize)]
/// Defines the way the logging of the coordinator is done via filter.
pub struct LogSettings {
    /// Tokio tracing filter which filters spans and events based on a set of filter directives.
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "mosaic_coordinator=debug,info"
    /// ```
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
            write!(formatter, "a valid tracing-subscriber EnvFilter directive string")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_and_validate() {
        let settings = Settings::new(None::<&Path>).unwrap();
        assert_eq!(settings.api.worker_pool_size, 5);
        assert_eq!(settings.api.request_queue_capacity, 64);
        assert_eq!(settings.api.shutdown_grace_period_seconds, 30);
        assert_eq!(settings.round.min_clients, 1);
        assert!(settings.security.enabled);
    }
}
