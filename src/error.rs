//! Error types for kvsession
//!
//! This module provides the storage error taxonomy using thiserror. Every
//! manager converts these into the [`Response`](crate::types::Response)
//! envelope at its public boundary.

use thiserror::Error;

/// Storage-related errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    /// Connection failed
    #[error("Storage connection failed: {0}")]
    Connection(String),

    /// Query failed
    #[error("Storage query failed: {0}")]
    Query(String),

    /// Serialization failed
    #[error("Storage serialization failed: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Storage deserialization failed: {0}")]
    Deserialization(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Storage backend not available (not connected, shut down)
    #[error("Storage backend not available: {0}")]
    BackendUnavailable(String),

    /// Caller supplied an identifier or payload the key space cannot hold
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal storage error
    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether this error reports a missing primary key
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this error reports a duplicate primary key
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub(crate) fn serialize(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }

    pub(crate) fn deserialize(err: serde_json::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

#[cfg(feature = "redis-storage")]
impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else if err.is_timeout() {
            Self::Connection(format!("timed out: {}", err))
        } else {
            Self::Query(err.to_string())
        }
    }
}

/// Type alias for Storage Result
pub type StorageResult<T> = std::result::Result<T, StorageError>;
