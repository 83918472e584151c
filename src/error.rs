//! Crate error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Invalid target format '{input}': {reason}")]
    InvalidTargetFormat { input: String, reason: String },

    #[error("No connection found for {0}")]
    ConnectionNotFound(String),

    #[error("Connection to {0} is unhealthy")]
    ConnectionUnhealthy(String),

    #[error("Timed out establishing connection to {target} after {attempts} attempts")]
    ConnectionTimeout { target: String, attempts: u32 },

    #[error("Failed to write cache entry for {target}: {source}")]
    CacheWriteFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No valid cached device type for {0}")]
    CacheMiss(String),

    #[error("No last target recorded")]
    NoLastTarget,

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;
