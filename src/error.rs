//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cache cannot be built from the supplied configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The shared store could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid entry options: {0}")]
    InvalidOptions(String),
}

impl CacheError {
    /// Whether this error means the shared store is unreachable, as opposed
    /// to a failed command on a live connection.
    pub fn is_connection(&self) -> bool {
        match self {
            CacheError::Redis(e) => {
                e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_timeout()
            }
            CacheError::Connection(_) => true,
            _ => false,
        }
    }
}
