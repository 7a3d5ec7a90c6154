//! Error types for the registry client

use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lease grant error: {0}")]
    LeaseGrant(String),

    #[error("Write error for key {key}: {reason}")]
    Write { key: String, reason: String },

    #[error("Lease revoke error: {0}")]
    Revoke(String),

    #[error("Watch error for prefix {prefix}: {reason}")]
    Watch { prefix: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Component already closed")]
    Closed,
}

impl RegistryError {
    pub fn write(key: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::Write {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn watch(prefix: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::Watch {
            prefix: prefix.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for RegistryError {
    fn from(err: config::ConfigError) -> Self {
        RegistryError::Config(err.to_string())
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
