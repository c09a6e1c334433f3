//! Configuration management for dlhive
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `DLHIVE__<section>__<key>`
//!
//! Examples:
//! - `DLHIVE__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `DLHIVE__DOWNLOADS__MAX_CONCURRENT=5`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/dlhive.toml`.
//! This can be overridden using the `DLHIVE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use models::{
    BackendsConfig, Config, DirectBackendConfig, DownloadsConfig, EngineConfig, EventsConfig,
    ServerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`DLHIVE__*`)
    /// 2. TOML file (default: `config/dlhive.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
