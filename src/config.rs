//! Pipeline configuration.
//!
//! Collects the knobs every component reads: store and object locations,
//! the trainer sidecar address, polling cadence, retry bounds and training
//! defaults. Values come from `MODELFORGE_*` environment variables with
//! sensible defaults for local development.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestration engine.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Storage settings
    /// PostgreSQL connection URL for the record store.
    pub database_url: String,
    /// Root directory of the filesystem object store.
    pub object_store_path: PathBuf,
    /// Catalog directory served by the local dataset source.
    pub catalog_path: PathBuf,

    // Trainer settings
    /// Base URL of the trainer sidecar.
    pub trainer_url: String,
    /// Default number of training epochs when a record does not set one.
    pub default_epochs: u32,
    /// Default learning rate when a record does not set one.
    pub default_learning_rate: f64,

    // Split settings
    /// Default fraction of each class assigned to training on auto-split.
    pub train_ratio: f64,
    /// Default fraction of each class assigned to validation.
    pub val_ratio: f64,

    // Scheduling settings
    /// Interval between scheduler poll cycles.
    pub poll_interval: Duration,
    /// Retry schedule for external I/O (downloads, uploads, searches).
    pub io_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/modelforge".to_string(),
            object_store_path: PathBuf::from("./objects"),
            catalog_path: PathBuf::from("./catalog"),

            trainer_url: "http://localhost:8500".to_string(),
            default_epochs: 10,
            default_learning_rate: 0.001,

            train_ratio: 0.7,
            val_ratio: 0.2,

            poll_interval: Duration::from_secs(10),
            io_retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MODELFORGE_DATABASE_URL` (or `DATABASE_URL`): PostgreSQL URL (required)
    /// - `MODELFORGE_OBJECT_STORE_PATH`: object store root (default: ./objects)
    /// - `MODELFORGE_CATALOG_PATH`: dataset catalog directory (default: ./catalog)
    /// - `MODELFORGE_TRAINER_URL`: trainer sidecar URL (default: http://localhost:8500)
    /// - `MODELFORGE_DEFAULT_EPOCHS`: training epochs (default: 10)
    /// - `MODELFORGE_DEFAULT_LEARNING_RATE`: learning rate (default: 0.001)
    /// - `MODELFORGE_TRAIN_RATIO`: auto-split train fraction (default: 0.7)
    /// - `MODELFORGE_VAL_RATIO`: auto-split val fraction (default: 0.2)
    /// - `MODELFORGE_POLL_INTERVAL_SECS`: scheduler interval (default: 10)
    /// - `MODELFORGE_IO_RETRY_ATTEMPTS`: attempts per external I/O call (default: 2)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the database URL is missing or any variable
    /// has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("MODELFORGE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("MODELFORGE_DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("MODELFORGE_OBJECT_STORE_PATH") {
            config.object_store_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("MODELFORGE_CATALOG_PATH") {
            config.catalog_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("MODELFORGE_TRAINER_URL") {
            config.trainer_url = val;
        }

        if let Ok(val) = std::env::var("MODELFORGE_DEFAULT_EPOCHS") {
            config.default_epochs = parse_env_value(&val, "MODELFORGE_DEFAULT_EPOCHS")?;
        }

        if let Ok(val) = std::env::var("MODELFORGE_DEFAULT_LEARNING_RATE") {
            config.default_learning_rate =
                parse_env_value(&val, "MODELFORGE_DEFAULT_LEARNING_RATE")?;
        }

        if let Ok(val) = std::env::var("MODELFORGE_TRAIN_RATIO") {
            config.train_ratio = parse_env_value(&val, "MODELFORGE_TRAIN_RATIO")?;
        }

        if let Ok(val) = std::env::var("MODELFORGE_VAL_RATIO") {
            config.val_ratio = parse_env_value(&val, "MODELFORGE_VAL_RATIO")?;
        }

        if let Ok(val) = std::env::var("MODELFORGE_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "MODELFORGE_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MODELFORGE_IO_RETRY_ATTEMPTS") {
            let attempts: u32 = parse_env_value(&val, "MODELFORGE_IO_RETRY_ATTEMPTS")?;
            config.io_retry = RetryPolicy::new(attempts);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.trainer_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "trainer_url cannot be empty".to_string(),
            ));
        }

        if self.default_epochs == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_epochs must be greater than 0".to_string(),
            ));
        }

        if self.default_learning_rate <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "default_learning_rate must be greater than 0".to_string(),
            ));
        }

        if self.train_ratio <= 0.0
            || self.val_ratio <= 0.0
            || self.train_ratio + self.val_ratio >= 1.0
        {
            return Err(ConfigError::ValidationFailed(
                "train_ratio and val_ratio must be positive and sum below 1.0".to_string(),
            ));
        }

        if self.poll_interval.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the object store root.
    pub fn with_object_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.object_store_path = path.into();
        self
    }

    /// Builder method to set the catalog directory.
    pub fn with_catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = path.into();
        self
    }

    /// Builder method to set the trainer sidecar URL.
    pub fn with_trainer_url(mut self, url: impl Into<String>) -> Self {
        self.trainer_url = url.into();
        self
    }

    /// Builder method to set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the external I/O retry policy.
    pub fn with_io_retry(mut self, policy: RetryPolicy) -> Self {
        self.io_retry = policy;
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{value}'"),
    })
}
