//! Common type definitions shared by the managers
//!
//! This module provides the uniform response envelope, pagination results
//! and the three-way TTL status reported by the store.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Open key/value map attached to sessions and messages
pub type Metadata = HashMap<String, serde_json::Value>;

/// Uniform result envelope returned by every manager operation
///
/// Managers never propagate faults to their callers; failures are reported
/// as data with `success == false` and a message prefixed by the name of the
/// failing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl<T> Response<T> {
    /// Successful response carrying `data`
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            count: None,
        }
    }

    /// Failed response with a human-readable message
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            count: None,
        }
    }

    /// Attach a result count
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Map a storage result into the envelope, naming the operation on failure
    pub fn from_result(operation: &str, result: StorageResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failure(format!("Failed to {}: {}", operation, err)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Error message, if this response is a failure
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Convert back into a `Result`, dropping the count
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (_, _) => Err(self
                .error
                .unwrap_or_else(|| "response carried no data".to_string())),
        }
    }
}

impl<T> Response<Vec<T>> {
    /// Envelope for list results; `count` is the number of items returned
    pub fn from_list(operation: &str, result: StorageResult<Vec<T>>) -> Self {
        match result {
            Ok(items) => {
                let count = items.len();
                Self::ok(items).with_count(count)
            }
            Err(err) => Self::from_result(operation, Err(err)),
        }
    }
}

impl Response<usize> {
    /// Envelope for operations whose payload is itself a count
    pub fn from_count(operation: &str, result: StorageResult<usize>) -> Self {
        match result {
            Ok(n) => Self::ok(n).with_count(n),
            Err(err) => Self::from_result(operation, Err(err)),
        }
    }
}

/// One page of an ordered listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Remaining lifetime of a key as reported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlStatus {
    /// Key exists without expiry (`-1`)
    Persistent,
    /// Key is absent or already expired (`-2`)
    Missing,
    /// Key expires in the given number of seconds
    Expires(u64),
}

impl TtlStatus {
    /// Decode the store's integer TTL reply
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            -1 => Self::Persistent,
            n if n < 0 => Self::Missing,
            n => Self::Expires(n as u64),
        }
    }

    /// Encode back into the store's integer convention
    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Persistent => -1,
            Self::Missing => -2,
            Self::Expires(secs) => *secs as i64,
        }
    }

    /// Seconds left before expiry, if the key has a positive TTL
    pub fn remaining(&self) -> Option<u64> {
        match self {
            Self::Expires(secs) if *secs > 0 => Some(*secs),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

impl fmt::Display for TtlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::Missing => write!(f, "missing"),
            Self::Expires(secs) => write!(f, "{}s", secs),
        }
    }
}
