//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::bus::MessagingConfig;
use crate::dispatch::{ConsumersConfig, RetryPolicy};
use crate::publisher::PublisherConfig;
use crate::topology::{BrokerTopology, TopologyConfig};

pub use crate::utils::bootstrap::LOG_ENV_VAR;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PAYMENT_RELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PAYMENT_RELAY";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Exchange, queue and routing key names.
    pub topology: TopologyConfig,
    /// Send retry and confirm handling.
    pub publisher: PublisherConfig,
    /// Per-queue concurrency and retry settings.
    pub consumers: ConsumersConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Check settings that would otherwise only fail once the service runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerTopology::order_payment(&self.topology)
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        for (queue, consumer) in [
            (&self.topology.success_queue, &self.consumers.success),
            (&self.topology.failed_queue, &self.consumers.failed),
        ] {
            RetryPolicy::from_config(queue, &consumer.retry)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        if self.publisher.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "publisher.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
