//! Core error types for the publish-to-web agent

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a [`ConfigStore`](crate::store::ConfigStore)
#[derive(Error, Debug)]
pub enum StoreError {
    /// Key cannot be mapped onto the backing storage
    #[error("Invalid store key: {0:?}")]
    InvalidKey(String),

    /// Stored value is not valid UTF-8
    #[error("Value for {key} is not valid UTF-8")]
    InvalidValue { key: String },

    /// I/O error from the backing storage
    #[error("Store I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
