//! Error types for spp-cache

use thiserror::Error;

/// Errors that can occur while reading or writing the response cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key is not a 64-char hex digest
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
