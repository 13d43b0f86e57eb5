//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{ConsumerConfig, MessagingConfig};
pub use storage::{StorageConfig, StorageType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CHATSYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CHATSYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CHATSYNC_LOG";
/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "CHATSYNC_LOG_FORMAT";
/// Broker URL variable read by the services before layered configuration.
pub const LEGACY_BROKER_URL_ENV_VAR: &str = "RABBITMQ_URL";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub messaging: MessagingConfig,
    pub consumer: ConsumerConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// `RABBITMQ_URL` fills `messaging.url` when none of the above set it.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
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

        let mut config: Config = config.try_deserialize()?;

        if config.messaging.broker_url().is_none() {
            config.messaging.url = std::env::var(LEGACY_BROKER_URL_ENV_VAR)
                .ok()
                .filter(|u| !u.trim().is_empty());
        }

        Ok(config)
    }

    /// Create config for testing: in-process broker, in-memory storage.
    pub fn for_test() -> Self {
        Self {
            messaging: MessagingConfig {
                url: Some("memory://test".to_string()),
            },
            ..Default::default()
        }
    }
}
