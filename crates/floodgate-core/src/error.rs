//! Error types for floodgate core library.
//!
//! The cache and rate limiter never fail; absence and denial are values.
//! Errors only come from configuration loading and the document store.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for floodgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for floodgate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Document store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Document store errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Store could not be reached or rejected the call
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Update targeted a document that does not exist
    #[error("Document not found: {collection}/{doc_id}")]
    NotFound { collection: String, doc_id: String },

    /// Commit exceeded the per-commit write limit
    #[error("Batch too large: {size} writes (max {max})")]
    BatchTooLarge { size: usize, max: usize },

    /// Call did not complete in time
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// Circuit breaker refused the call
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// Store client could not be constructed
    #[error("Store not configured: {0}")]
    NotConfigured(String),
}

impl StoreError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::CircuitOpen
        )
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
