//! Typed store commands, replies and the pipeline builder
//!
//! Every primitive the managers need is one [`Command`] variant. Backends
//! translate commands into their own wire format; callers never build raw
//! command strings.

use crate::error::{StorageError, StorageResult};
use std::collections::HashMap;

/// What happens to a key's TTL when it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Remove any TTL; the key becomes persistent
    Persist,
    /// Expire after the given number of seconds
    Seconds(u64),
    /// Keep whatever TTL the key already has
    Keep,
}

impl Expiry {
    /// `Some(ttl)` expires, `None` or a zero TTL persists
    pub fn from_ttl(ttl: Option<u64>) -> Self {
        match ttl {
            Some(secs) if secs > 0 => Self::Seconds(secs),
            _ => Self::Persist,
        }
    }
}

/// Precondition on a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    Always,
    /// Only write when the key does not exist (NX)
    IfAbsent,
    /// Only write when the key already exists (XX)
    IfPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set {
        key: String,
        value: String,
        expiry: Expiry,
        condition: SetCondition,
    },
    Del { keys: Vec<String> },
    Exists { key: String },
    Expire { key: String, seconds: u64 },
    Ttl { key: String },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    HGetAll { key: String },
    HDel { key: String, field: String },
    LPush { key: String, values: Vec<String> },
    RPush { key: String, values: Vec<String> },
    LRange { key: String, start: i64, stop: i64 },
    LLen { key: String },
    LRem { key: String, count: i64, value: String },
    SAdd { key: String, members: Vec<String> },
    SMembers { key: String },
    SRem { key: String, members: Vec<String> },
    Keys { pattern: String },
}

impl Command {
    /// Command name as sent to the store
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::Del { .. } => "DEL",
            Self::Exists { .. } => "EXISTS",
            Self::Expire { .. } => "EXPIRE",
            Self::Ttl { .. } => "TTL",
            Self::HGet { .. } => "HGET",
            Self::HSet { .. } => "HSET",
            Self::HGetAll { .. } => "HGETALL",
            Self::HDel { .. } => "HDEL",
            Self::LPush { .. } => "LPUSH",
            Self::RPush { .. } => "RPUSH",
            Self::LRange { .. } => "LRANGE",
            Self::LLen { .. } => "LLEN",
            Self::LRem { .. } => "LREM",
            Self::SAdd { .. } => "SADD",
            Self::SMembers { .. } => "SMEMBERS",
            Self::SRem { .. } => "SREM",
            Self::Keys { .. } => "KEYS",
        }
    }

    /// Shape of the reply this command produces
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            Self::Get { .. } | Self::HGet { .. } => ReplyKind::Bulk,
            Self::Set { .. } => ReplyKind::Status,
            Self::HGetAll { .. } => ReplyKind::Map,
            Self::LRange { .. } | Self::SMembers { .. } | Self::Keys { .. } => ReplyKind::List,
            _ => ReplyKind::Integer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Status,
    Integer,
    Bulk,
    List,
    Map,
}

/// A single command reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Absent value, or a conditional write that was refused
    Nil,
    Ok,
    Integer(i64),
    Bulk(String),
    List(Vec<String>),
    Map(HashMap<String, String>),
}

impl Reply {
    pub fn into_optional_string(self) -> StorageResult<Option<String>> {
        match self {
            Self::Nil => Ok(None),
            Self::Bulk(value) => Ok(Some(value)),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    pub fn into_integer(self) -> StorageResult<i64> {
        match self {
            Self::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_list(self) -> StorageResult<Vec<String>> {
        match self {
            Self::List(items) => Ok(items),
            Self::Nil => Ok(Vec::new()),
            other => Err(unexpected("list", &other)),
        }
    }

    pub fn into_map(self) -> StorageResult<HashMap<String, String>> {
        match self {
            Self::Map(map) => Ok(map),
            Self::Nil => Ok(HashMap::new()),
            other => Err(unexpected("map", &other)),
        }
    }

    /// Whether a (possibly conditional) write was applied
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

fn unexpected(expected: &str, got: &Reply) -> StorageError {
    StorageError::Query(format!("expected {} reply, got {:?}", expected, got))
}

/// Batched command builder
///
/// Commands are queued locally and sent in one round trip by
/// [`StoreClient::execute`](crate::store::StoreClient::execute). Replies come
/// back in queue order. The batch is not atomic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command, returning its reply index
    pub fn push(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn get(&mut self, key: impl Into<String>) -> usize {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        expiry: Expiry,
        condition: SetCondition,
    ) -> usize {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            expiry,
            condition,
        })
    }

    pub fn del(&mut self, key: impl Into<String>) -> usize {
        self.push(Command::Del {
            keys: vec![key.into()],
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, seconds: u64) -> usize {
        self.push(Command::Expire {
            key: key.into(),
            seconds,
        })
    }

    pub fn ttl(&mut self, key: impl Into<String>) -> usize {
        self.push(Command::Ttl { key: key.into() })
    }

    pub fn lpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> usize {
        self.push(Command::LPush {
            key: key.into(),
            values: vec![value.into()],
        })
    }

    pub fn lrem(&mut self, key: impl Into<String>, count: i64, value: impl Into<String>) -> usize {
        self.push(Command::LRem {
            key: key.into(),
            count,
            value: value.into(),
        })
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> usize {
        self.push(Command::SAdd {
            key: key.into(),
            members: vec![member.into()],
        })
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> usize {
        self.push(Command::SRem {
            key: key.into(),
            members: vec![member.into()],
        })
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}
