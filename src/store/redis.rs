//! Redis key-value store implementation
//!
//! Available with the `redis-storage` feature. Uses a multiplexed
//! [`ConnectionManager`] which reconnects on its own after the initial
//! connect succeeds.

use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::store::command::{Command, Expiry, Reply, ReplyKind, SetCondition};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Cmd, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

const RECONNECT_EXPONENT_BASE: u64 = 2;
const RECONNECT_FACTOR_MS: u64 = 50;
const RECONNECT_RETRIES: usize = 6;
/// Ceiling for a single reconnect delay
const RECONNECT_MAX_DELAY_MS: u64 = 2_000;

fn reconnect_config() -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_exponent_base(RECONNECT_EXPONENT_BASE)
        .set_factor(RECONNECT_FACTOR_MS)
        .set_number_of_retries(RECONNECT_RETRIES)
        .set_max_delay(RECONNECT_MAX_DELAY_MS)
}

/// Redis-backed key-value store
pub struct RedisStore {
    client: Client,
    connection: RwLock<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Build a store for the configured server; no connection is made yet
    pub fn new(config: &StoreConfig) -> Result<Self, StorageError> {
        let client = Client::open(config.redis_url())
            .map_err(|e| StorageError::Connection(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let guard = self
            .connection
            .read()
            .map_err(|_| StorageError::Internal("connection lock poisoned".to_string()))?;
        guard.clone().ok_or_else(|| {
            StorageError::BackendUnavailable("redis store is not connected".to_string())
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn connect(&self) -> Result<(), StorageError> {
        if self.is_connected() {
            return Ok(());
        }
        let manager = ConnectionManager::new_with_config(self.client.clone(), reconnect_config()).await?;
        let mut guard = self
            .connection
            .write()
            .map_err(|_| StorageError::Internal("connection lock poisoned".to_string()))?;
        *guard = Some(manager);
        info!("Redis connection established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let mut guard = self
            .connection
            .write()
            .map_err(|_| StorageError::Internal("connection lock poisoned".to_string()))?;
        if guard.take().is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    async fn query(&self, command: Command) -> Result<Reply, StorageError> {
        let mut conn = self.connection()?;
        let kind = command.reply_kind();
        let value: Value = to_cmd(&command).query_async(&mut conn).await?;
        decode(kind, &value)
    }

    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StorageError> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        let kinds: Vec<ReplyKind> = commands.iter().map(Command::reply_kind).collect();
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }
        debug!(commands = commands.len(), "Redis pipeline");
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        kinds
            .into_iter()
            .zip(values.iter())
            .map(|(kind, value)| decode(kind, value))
            .collect()
    }
}

fn to_cmd(command: &Command) -> Cmd {
    let mut cmd = redis::cmd(command.name());
    match command {
        Command::Get { key }
        | Command::Exists { key }
        | Command::Ttl { key }
        | Command::HGetAll { key }
        | Command::LLen { key }
        | Command::SMembers { key } => {
            cmd.arg(key);
        }
        Command::Set {
            key,
            value,
            expiry,
            condition,
        } => {
            cmd.arg(key).arg(value);
            match expiry {
                Expiry::Persist => {}
                Expiry::Seconds(secs) => {
                    cmd.arg("EX").arg(*secs);
                }
                Expiry::Keep => {
                    cmd.arg("KEEPTTL");
                }
            }
            match condition {
                SetCondition::Always => {}
                SetCondition::IfAbsent => {
                    cmd.arg("NX");
                }
                SetCondition::IfPresent => {
                    cmd.arg("XX");
                }
            }
        }
        Command::Del { keys } => {
            cmd.arg(keys);
        }
        Command::Expire { key, seconds } => {
            cmd.arg(key).arg(*seconds);
        }
        Command::HGet { key, field } | Command::HDel { key, field } => {
            cmd.arg(key).arg(field);
        }
        Command::HSet { key, field, value } => {
            cmd.arg(key).arg(field).arg(value);
        }
        Command::LPush { key, values } | Command::RPush { key, values } => {
            cmd.arg(key).arg(values);
        }
        Command::LRange { key, start, stop } => {
            cmd.arg(key).arg(*start).arg(*stop);
        }
        Command::LRem { key, count, value } => {
            cmd.arg(key).arg(*count).arg(value);
        }
        Command::SAdd { key, members } | Command::SRem { key, members } => {
            cmd.arg(key).arg(members);
        }
        Command::Keys { pattern } => {
            cmd.arg(pattern);
        }
    }
    cmd
}

fn decode(kind: ReplyKind, value: &Value) -> Result<Reply, StorageError> {
    let reply = match kind {
        ReplyKind::Status => match value {
            Value::Nil => Reply::Nil,
            _ => Reply::Ok,
        },
        ReplyKind::Integer => Reply::Integer(redis::from_redis_value::<i64>(value)?),
        ReplyKind::Bulk => match redis::from_redis_value::<Option<String>>(value)? {
            Some(s) => Reply::Bulk(s),
            None => Reply::Nil,
        },
        ReplyKind::List => Reply::List(redis::from_redis_value::<Vec<String>>(value)?),
        ReplyKind::Map => Reply::Map(redis::from_redis_value::<HashMap<String, String>>(value)?),
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_command_arguments() {
        let cmd = to_cmd(&Command::Set {
            key: "s:abc".into(),
            value: "{}".into(),
            expiry: Expiry::Keep,
            condition: SetCondition::IfPresent,
        });
        let packed = String::from_utf8_lossy(&cmd.get_packed_command()).to_string();
        assert!(packed.contains("SET"));
        assert!(packed.contains("KEEPTTL"));
        assert!(packed.contains("XX"));
        assert!(!packed.contains("NX"));
    }

    #[test]
    fn test_decode_replies() {
        assert_eq!(decode(ReplyKind::Status, &Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(decode(ReplyKind::Status, &Value::Okay).unwrap(), Reply::Ok);
        assert_eq!(decode(ReplyKind::Integer, &Value::Int(-2)).unwrap(), Reply::Integer(-2));
        assert_eq!(decode(ReplyKind::Bulk, &Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(
            decode(ReplyKind::Bulk, &Value::BulkString(b"v".to_vec())).unwrap(),
            Reply::Bulk("v".into())
        );
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let uncapped = RECONNECT_FACTOR_MS * RECONNECT_EXPONENT_BASE.pow(RECONNECT_RETRIES as u32);
        assert!(uncapped > RECONNECT_MAX_DELAY_MS);
        assert!(RECONNECT_MAX_DELAY_MS >= RECONNECT_FACTOR_MS);
        let _config = reconnect_config();
    }

    #[test]
    fn test_not_connected_until_connect() {
        let store = RedisStore::new(&StoreConfig::default()).unwrap();
        assert!(!store.is_connected());
        assert!(matches!(
            store.connection(),
            Err(StorageError::BackendUnavailable(_))
        ));
    }
}
