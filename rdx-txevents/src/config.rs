//! Defines the configuration structure for the event bus.
//!
//! `BusConfig` is designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`, with environment overrides layered on
//! top. Every field has a default, so an empty file is a valid config.

use crate::error::ConfigurationError;
use serde::Deserialize;
use std::path::Path;

/// Prefix for environment overrides, e.g. `TXEVENTS__ASYNC_WORKERS=8`.
pub const ENV_PREFIX: &str = "TXEVENTS";

/// The top-level configuration for the `EventBus`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of background tasks draining the ASYNC listener queue.
    pub async_workers: usize,

    /// Maximum number of ASYNC deliveries waiting for a worker.
    /// Deliveries beyond this are rejected and reported to the observer.
    pub async_queue_capacity: usize,

    /// Buffer size of the `SystemEvent` broadcast channel.
    pub system_event_capacity: usize,

    /// Priority given to listeners that do not set one explicitly.
    pub default_priority: i32,

    /// Convert panics in SYNC handlers into listener failures instead of
    /// unwinding through the publisher.
    pub catch_panics: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            async_workers: 4,
            async_queue_capacity: 1024,
            system_event_capacity: 64,
            default_priority: 0,
            catch_panics: true,
        }
    }
}

impl BusConfig {
    /// Loads the configuration from an optional TOML file plus `TXEVENTS__*`
    /// environment variables. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: BusConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.async_workers == 0 {
            return Err(ConfigurationError::Invalid(
                "async_workers must be at least 1".to_string(),
            ));
        }
        if self.async_queue_capacity == 0 {
            return Err(ConfigurationError::Invalid(
                "async_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.system_event_capacity == 0 {
            return Err(ConfigurationError::Invalid(
                "system_event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.async_workers, 4);
        assert!(config.catch_panics);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = BusConfig {
            async_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Invalid(_))
        ));
    }

    #[test]
    fn loads_partial_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "txevents-config-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "async_workers = 2\ndefault_priority = 10").unwrap();
        drop(file);

        let config = BusConfig::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.async_workers, 2);
        assert_eq!(config.default_priority, 10);
        assert_eq!(config.async_queue_capacity, 1024);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("txevents-definitely-missing.toml");
        let config = BusConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.system_event_capacity, 64);
    }
}
