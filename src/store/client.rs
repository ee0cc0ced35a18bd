//! Store client
//!
//! [`StoreClient`] wraps a [`KeyValueStore`] backend and exposes the typed
//! primitives the managers are written against. Connection is an explicit
//! barrier: [`StoreClient::connect`] must complete before any primitive is
//! used, otherwise the primitive fails with
//! [`StorageError::BackendUnavailable`].

use crate::config::StoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::store::command::{Command, Expiry, Pipeline, Reply, SetCondition};
use crate::store::{KeyValueStore, MemoryStore};
use crate::types::TtlStatus;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared handle to the key-value store
///
/// Cloning is cheap; all clones share one backend and one connection state.
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn KeyValueStore>,
    connect_timeout: Duration,
}

impl fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("connected", &self.backend.is_connected())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl StoreClient {
    pub fn new(backend: Arc<dyn KeyValueStore>, config: &StoreConfig) -> Self {
        Self {
            backend,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Client over a fresh [`MemoryStore`] with default settings
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), &StoreConfig::default())
    }

    /// Connect to the backend, bounded by the configured timeout
    ///
    /// Idempotent: returns immediately when already connected.
    pub async fn connect(&self) -> StorageResult<()> {
        if self.backend.is_connected() {
            return Ok(());
        }
        match tokio::time::timeout(self.connect_timeout, self.backend.connect()).await {
            Ok(Ok(())) => {
                info!("Connected to key-value store");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Key-value store connection failed");
                Err(e)
            }
            Err(_) => {
                warn!(timeout = ?self.connect_timeout, "Key-value store connection timed out");
                Err(StorageError::Connection(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                )))
            }
        }
    }

    pub async fn disconnect(&self) -> StorageResult<()> {
        if !self.backend.is_connected() {
            return Ok(());
        }
        self.backend.disconnect().await?;
        info!("Disconnected from key-value store");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    fn ensure_connected(&self) -> StorageResult<()> {
        if self.backend.is_connected() {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable(
                "client is not connected; call connect() first".to_string(),
            ))
        }
    }

    /// Run a single command
    pub async fn query(&self, command: Command) -> StorageResult<Reply> {
        self.ensure_connected()?;
        debug!(command = command.name(), "Store query");
        self.backend.query(command).await
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.query(Command::Get {
            key: key.to_string(),
        })
        .await?
        .into_optional_string()
    }

    /// Unconditional write; `ttl` of `None` makes the key persistent
    pub async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> StorageResult<()> {
        self.set_with(key, value, Expiry::from_ttl(ttl), SetCondition::Always)
            .await
            .map(|_| ())
    }

    /// Conditional write
    ///
    /// # Returns
    ///
    /// `true` if the value was written, `false` if the condition refused it
    pub async fn set_with(
        &self,
        key: &str,
        value: &str,
        expiry: Expiry,
        condition: SetCondition,
    ) -> StorageResult<bool> {
        let reply = self
            .query(Command::Set {
                key: key.to_string(),
                value: value.to_string(),
                expiry,
                condition,
            })
            .await?;
        Ok(reply.is_ok())
    }

    /// Delete one key, returning whether it existed
    pub async fn del(&self, key: &str) -> StorageResult<bool> {
        Ok(self.del_many(vec![key.to_string()]).await? > 0)
    }

    pub async fn del_many(&self, keys: Vec<String>) -> StorageResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.query(Command::Del { keys }).await?.into_integer()?;
        Ok(removed.max(0) as usize)
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        let n = self
            .query(Command::Exists {
                key: key.to_string(),
            })
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    pub async fn expire(&self, key: &str, seconds: u64) -> StorageResult<bool> {
        let n = self
            .query(Command::Expire {
                key: key.to_string(),
                seconds,
            })
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    pub async fn ttl(&self, key: &str) -> StorageResult<TtlStatus> {
        let raw = self
            .query(Command::Ttl {
                key: key.to_string(),
            })
            .await?
            .into_integer()?;
        Ok(TtlStatus::from_raw(raw))
    }

    pub async fn hget(&self, key: &str, field: &str) -> StorageResult<Option<String>> {
        self.query(Command::HGet {
            key: key.to_string(),
            field: field.to_string(),
        })
        .await?
        .into_optional_string()
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StorageResult<bool> {
        let n = self
            .query(Command::HSet {
                key: key.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            })
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    pub async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        self.query(Command::HGetAll {
            key: key.to_string(),
        })
        .await?
        .into_map()
    }

    pub async fn hdel(&self, key: &str, field: &str) -> StorageResult<bool> {
        let n = self
            .query(Command::HDel {
                key: key.to_string(),
                field: field.to_string(),
            })
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    /// Push onto the head of a list, returning the new length
    pub async fn lpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        let n = self
            .query(Command::LPush {
                key: key.to_string(),
                values: vec![value.to_string()],
            })
            .await?
            .into_integer()?;
        Ok(n.max(0) as usize)
    }

    pub async fn rpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        let n = self
            .query(Command::RPush {
                key: key.to_string(),
                values: vec![value.to_string()],
            })
            .await?
            .into_integer()?;
        Ok(n.max(0) as usize)
    }

    /// Inclusive index range; negative indices count from the tail
    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> StorageResult<Vec<String>> {
        self.query(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_list()
    }

    pub async fn llen(&self, key: &str) -> StorageResult<usize> {
        let n = self
            .query(Command::LLen {
                key: key.to_string(),
            })
            .await?
            .into_integer()?;
        Ok(n.max(0) as usize)
    }

    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> StorageResult<usize> {
        let n = self
            .query(Command::LRem {
                key: key.to_string(),
                count,
                value: value.to_string(),
            })
            .await?
            .into_integer()?;
        Ok(n.max(0) as usize)
    }

    /// Add a set member, returning whether it was new
    pub async fn sadd(&self, key: &str, member: &str) -> StorageResult<bool> {
        let n = self
            .query(Command::SAdd {
                key: key.to_string(),
                members: vec![member.to_string()],
            })
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    pub async fn smembers(&self, key: &str) -> StorageResult<Vec<String>> {
        self.query(Command::SMembers {
            key: key.to_string(),
        })
        .await?
        .into_list()
    }

    pub async fn srem(&self, key: &str, member: &str) -> StorageResult<bool> {
        let n = self
            .query(Command::SRem {
                key: key.to_string(),
                members: vec![member.to_string()],
            })
            .await?
            .into_integer()?;
        Ok(n > 0)
    }

    /// Enumerate keys matching a glob pattern
    ///
    /// This scans the whole key space on the store; keep it off hot paths.
    pub async fn keys(&self, pattern: &str) -> StorageResult<Vec<String>> {
        self.query(Command::Keys {
            pattern: pattern.to_string(),
        })
        .await?
        .into_list()
    }

    /// Read and decode one JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(StorageError::deserialize),
            None => Ok(None),
        }
    }

    /// Read many JSON values in one pipeline
    ///
    /// Missing keys are skipped. Values that fail to decode are skipped with
    /// a warning so one corrupt record cannot fail a whole listing.
    pub async fn get_json_many<T: DeserializeOwned>(&self, keys: &[String]) -> StorageResult<Vec<T>> {
        let mut pipe = self.pipeline();
        for key in keys {
            pipe.get(key.as_str());
        }
        let replies = self.execute(pipe).await?;

        let mut values = Vec::with_capacity(replies.len());
        for (key, reply) in keys.iter().zip(replies) {
            let Some(raw) = reply.into_optional_string()? else {
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(value) => values.push(value),
                Err(e) => warn!(key = %key, error = %e, "Skipping unparseable record"),
            }
        }
        Ok(values)
    }

    /// Start a new batch
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new()
    }

    /// Send a batch in one round trip
    ///
    /// Replies are returned in queue order.
    pub async fn execute(&self, pipeline: Pipeline) -> StorageResult<Vec<Reply>> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_connected()?;
        let expected = pipeline.len();
        debug!(commands = expected, "Store pipeline");
        let replies = self.backend.execute(pipeline.into_commands()).await?;
        if replies.len() != expected {
            return Err(StorageError::Internal(format!(
                "pipeline returned {} replies for {} commands",
                replies.len(),
                expected
            )));
        }
        Ok(replies)
    }
}
