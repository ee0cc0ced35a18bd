//! In-memory key-value store implementation
//!
//! This module provides a thread-safe, in-memory implementation of the
//! KeyValueStore trait using a HashMap protected by an async RwLock. Strings,
//! hashes, lists and sets are supported with per-key expiry measured on the
//! tokio clock, so tests can drive expiry with a paused runtime.

use crate::error::StorageError;
use crate::store::command::{Command, Expiry, Reply, SetCondition};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

impl Value {
    fn is_empty_aggregate(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Hash(map) => map.is_empty(),
            Self::List(list) => list.is_empty(),
            Self::Set(set) => set.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type Entries = HashMap<String, Entry>;

/// In-memory key-value store
///
/// Suitable for development, testing and single-process deployments.
///
/// # Examples
///
/// ```
/// use kvsession::store::{KeyValueStore, MemoryStore, Command, Reply};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///     store.connect().await?;
///
///     store.query(Command::SAdd { key: "idx".into(), members: vec!["a".into()] }).await?;
///     let reply = store.query(Command::SMembers { key: "idx".into() }).await?;
///     assert_eq!(reply, Reply::List(vec!["a".to_string()]));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<Entries>>,
    connected: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new, disconnected in-memory store
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of live (unexpired) keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every key
    ///
    /// This is primarily useful for testing purposes.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Store a raw string value, bypassing the command layer
    ///
    /// Lets tests plant values the managers would never write themselves,
    /// such as corrupt JSON.
    pub async fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .write()
            .await
            .insert(key.into(), Entry::new(Value::Str(value.into())));
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable(
                "memory store is not connected".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn query(&self, command: Command) -> Result<Reply, StorageError> {
        self.ensure_connected()?;
        let mut entries = self.entries.write().await;
        apply(&mut entries, command, Instant::now())
    }

    async fn execute(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StorageError> {
        self.ensure_connected()?;
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        commands
            .into_iter()
            .map(|command| apply(&mut entries, command, now))
            .collect()
    }
}

fn purge(entries: &mut Entries, key: &str, now: Instant) {
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
}

/// Drop aggregates that became empty, as the store does
fn drop_if_empty(entries: &mut Entries, key: &str) {
    if entries.get(key).is_some_and(|e| e.value.is_empty_aggregate()) {
        entries.remove(key);
    }
}

fn wrong_type() -> StorageError {
    StorageError::Query(WRONG_TYPE.to_string())
}

fn hash_mut<'a>(
    entries: &'a mut Entries,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, StorageError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
    match &mut entry.value {
        Value::Hash(map) => Ok(map),
        _ => Err(wrong_type()),
    }
}

fn list_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<&'a mut VecDeque<String>, StorageError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(wrong_type()),
    }
}

fn set_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<&'a mut BTreeSet<String>, StorageError> {
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
    match &mut entry.value {
        Value::Set(set) => Ok(set),
        _ => Err(wrong_type()),
    }
}

fn apply(entries: &mut Entries, command: Command, now: Instant) -> Result<Reply, StorageError> {
    match command {
        Command::Get { key } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Nil),
                Some(Value::Str(s)) => Ok(Reply::Bulk(s.clone())),
                Some(_) => Err(wrong_type()),
            }
        }
        Command::Set {
            key,
            value,
            expiry,
            condition,
        } => {
            purge(entries, &key, now);
            let existing = entries.get(&key);
            match (condition, existing.is_some()) {
                (SetCondition::IfAbsent, true) | (SetCondition::IfPresent, false) => {
                    return Ok(Reply::Nil)
                }
                _ => {}
            }
            let expires_at = match expiry {
                Expiry::Persist => None,
                Expiry::Seconds(0) => {
                    return Err(StorageError::Query(
                        "invalid expire time in 'set' command".to_string(),
                    ))
                }
                Expiry::Seconds(secs) => Some(now + Duration::from_secs(secs)),
                Expiry::Keep => existing.and_then(|e| e.expires_at),
            };
            entries.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at,
                },
            );
            Ok(Reply::Ok)
        }
        Command::Del { keys } => {
            let mut removed = 0;
            for key in keys {
                purge(entries, &key, now);
                if entries.remove(&key).is_some() {
                    removed += 1;
                }
            }
            Ok(Reply::Integer(removed))
        }
        Command::Exists { key } => {
            purge(entries, &key, now);
            Ok(Reply::Integer(entries.contains_key(&key) as i64))
        }
        Command::Expire { key, seconds } => {
            purge(entries, &key, now);
            if !entries.contains_key(&key) {
                return Ok(Reply::Integer(0));
            }
            if seconds == 0 {
                entries.remove(&key);
            } else if let Some(entry) = entries.get_mut(&key) {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
            }
            Ok(Reply::Integer(1))
        }
        Command::Ttl { key } => {
            purge(entries, &key, now);
            let raw = match entries.get(&key) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let millis = at.saturating_duration_since(now).as_millis() as i64;
                    (millis + 500) / 1000
                }
            };
            Ok(Reply::Integer(raw))
        }
        Command::HGet { key, field } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Nil),
                Some(Value::Hash(map)) => Ok(map.get(&field).cloned().map_or(Reply::Nil, Reply::Bulk)),
                Some(_) => Err(wrong_type()),
            }
        }
        Command::HSet { key, field, value } => {
            purge(entries, &key, now);
            let map = hash_mut(entries, &key)?;
            let added = map.insert(field, value).is_none();
            Ok(Reply::Integer(added as i64))
        }
        Command::HGetAll { key } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Map(HashMap::new())),
                Some(Value::Hash(map)) => Ok(Reply::Map(map.clone())),
                Some(_) => Err(wrong_type()),
            }
        }
        Command::HDel { key, field } => {
            purge(entries, &key, now);
            if !entries.contains_key(&key) {
                return Ok(Reply::Integer(0));
            }
            let removed = hash_mut(entries, &key)?.remove(&field).is_some();
            drop_if_empty(entries, &key);
            Ok(Reply::Integer(removed as i64))
        }
        Command::LPush { key, values } => {
            purge(entries, &key, now);
            let list = list_mut(entries, &key)?;
            for value in values {
                list.push_front(value);
            }
            Ok(Reply::Integer(list.len() as i64))
        }
        Command::RPush { key, values } => {
            purge(entries, &key, now);
            let list = list_mut(entries, &key)?;
            list.extend(values);
            Ok(Reply::Integer(list.len() as i64))
        }
        Command::LRange { key, start, stop } => {
            purge(entries, &key, now);
            let list = match entries.get(&key).map(|e| &e.value) {
                None => return Ok(Reply::List(Vec::new())),
                Some(Value::List(list)) => list,
                Some(_) => return Err(wrong_type()),
            };
            Ok(Reply::List(list_range(list, start, stop)))
        }
        Command::LLen { key } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::Integer(0)),
                Some(Value::List(list)) => Ok(Reply::Integer(list.len() as i64)),
                Some(_) => Err(wrong_type()),
            }
        }
        Command::LRem { key, count, value } => {
            purge(entries, &key, now);
            if !entries.contains_key(&key) {
                return Ok(Reply::Integer(0));
            }
            let list = list_mut(entries, &key)?;
            let removed = list_remove(list, count, &value);
            drop_if_empty(entries, &key);
            Ok(Reply::Integer(removed))
        }
        Command::SAdd { key, members } => {
            purge(entries, &key, now);
            let set = set_mut(entries, &key)?;
            let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
            Ok(Reply::Integer(added as i64))
        }
        Command::SMembers { key } => {
            purge(entries, &key, now);
            match entries.get(&key).map(|e| &e.value) {
                None => Ok(Reply::List(Vec::new())),
                Some(Value::Set(set)) => Ok(Reply::List(set.iter().cloned().collect())),
                Some(_) => Err(wrong_type()),
            }
        }
        Command::SRem { key, members } => {
            purge(entries, &key, now);
            if !entries.contains_key(&key) {
                return Ok(Reply::Integer(0));
            }
            let set = set_mut(entries, &key)?;
            let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
            drop_if_empty(entries, &key);
            Ok(Reply::Integer(removed as i64))
        }
        Command::Keys { pattern } => {
            let matcher = glob_to_regex(&pattern)?;
            entries.retain(|_, e| !e.is_expired(now));
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| matcher.is_match(k))
                .cloned()
                .collect();
            keys.sort();
            Ok(Reply::List(keys))
        }
    }
}

/// Inclusive range with negative indices counted from the tail
fn list_range(list: &VecDeque<String>, start: i64, stop: i64) -> Vec<String> {
    let len = list.len() as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return Vec::new();
    }
    list.range(start as usize..=stop as usize).cloned().collect()
}

/// Remove up to `count` occurrences: from the head when positive, the tail
/// when negative, all when zero
fn list_remove(list: &mut VecDeque<String>, count: i64, value: &str) -> i64 {
    let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
    let mut removed = 0usize;
    if count >= 0 {
        let mut i = 0;
        while i < list.len() && removed < limit {
            if list[i] == value {
                list.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
    } else {
        let mut i = list.len();
        while i > 0 && removed < limit {
            i -= 1;
            if list[i] == value {
                list.remove(i);
                removed += 1;
            }
        }
    }
    removed as i64
}

/// Translate a store glob (`*`, `?`, `[...]`, `\x`) into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex, StorageError> {
    let mut out = String::from("(?s)^");
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(next) => out.push_str(&regex::escape(&next.to_string())),
                None => out.push_str(r"\\"),
            },
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }
                if !closed || class.is_empty() {
                    out.push_str(r"\[");
                    out.push_str(&regex::escape(&class));
                    continue;
                }
                out.push('[');
                let body = match class.strip_prefix('^').or_else(|| class.strip_prefix('!')) {
                    Some(rest) => {
                        out.push('^');
                        rest
                    }
                    None => class.as_str(),
                };
                for c in body.chars() {
                    if c.is_ascii_punctuation() && c != '-' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| StorageError::Query(format!("invalid pattern '{}': {}", pattern, e)))
}
