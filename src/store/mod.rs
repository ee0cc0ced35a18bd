//! Key-value store backends
//!
//! This module provides trait-based abstraction over the remote key-value
//! store, allowing different backend implementations (in-memory, Redis).
//! Managers never talk to a backend directly; they go through
//! [`StoreClient`], which owns connection state and typed primitives.

use crate::error::StorageError;
use async_trait::async_trait;

pub mod client;
pub mod command;
pub mod memory;
#[cfg(feature = "redis-storage")]
pub mod redis;

pub use client::StoreClient;
pub use command::{Command, Expiry, Pipeline, Reply, ReplyKind, SetCondition};
pub use memory::MemoryStore;
#[cfg(feature = "redis-storage")]
pub use self::redis::RedisStore;

/// Trait for key-value store backends
///
/// This trait defines the capability every backend must provide: a
/// connection lifecycle, single commands and pipelined batches.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Establish the connection
    ///
    /// Calling this on a connected backend is a no-op.
    async fn connect(&self) -> Result<(), StorageError>;

    /// Close the connection
    ///
    /// Calling this on a disconnected backend is a no-op.
    async fn disconnect(&self) -> Result<(), StorageError>;

    /// Whether the backend is currently connected
    fn is_connected(&self) -> bool;

    /// Run one command in its own round trip
    ///
    /// # Returns
    ///
    /// The command's reply, or a storage error
    async fn query(&self, command: Command) -> Result<Reply, StorageError>;

    /// Run a batch of commands in one round trip
    ///
    /// Replies are returned in command order. Commands are not isolated from
    /// concurrent clients and a failure part-way may leave earlier commands
    /// applied.
    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StorageError>;
}
