//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use std::io;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Bad key, oversized item or invalid configuration value
    #[error("Validation error: {0}")]
    Validation(String),

    /// Envelope encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Missing codec support or unusable cache directory
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Filesystem failure (permission denied, disk full, rename failure)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arithmetic on a non-numeric stored value
    #[error("Type error: {0}")]
    Type(String),

    /// Advisory lock could not be acquired within the configured budget
    #[error("Lock timeout: {0}")]
    LockTimeout(String),
}

impl CacheError {
    /// Short machine-readable name of the error kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Validation(_) => "validation",
            CacheError::Serialization(_) => "serialization",
            CacheError::Configuration(_) => "configuration",
            CacheError::Io(_) => "io",
            CacheError::Type(_) => "type",
            CacheError::LockTimeout(_) => "lock_timeout",
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
