//! Session management for conversations
//!
//! This module provides the session record and its manager. A session lives
//! at `s:<id>`, is enumerated by the global `sessions:index` set and owns the
//! message structures under `s:<id>:…`. Deleting a session removes all of
//! them.

use crate::cache::Cache;
use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::store::{Expiry, Pipeline, SetCondition, StoreClient};
use crate::types::{Metadata, Response, TtlStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Sessions updated within this window count as active
const ACTIVE_WINDOW_MINUTES: i64 = 60;

/// Lifetime of the cached active-session listing
const ACTIVE_CACHE_TTL: u64 = 300;

/// A conversation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique identifier for the session
    pub session_id: String,
    /// Caller-defined attributes, merged on update
    #[serde(default)]
    pub metadata: Metadata,
    /// Lifetime in seconds requested at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, metadata: Metadata, ttl: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            metadata,
            ttl,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `updates` into the metadata key by key, bumping `updated_at`
    pub fn merge_metadata(&mut self, updates: Metadata) {
        self.metadata.extend(updates);
        self.updated_at = Utc::now();
    }

    /// Whether the session was touched within the active window
    pub fn is_active_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.updated_at > cutoff
    }
}

/// Liveness counts over the session index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

fn describe(session_id: &str) -> String {
    format!("session '{}'", session_id)
}

/// Queue removal of a session and everything it owns
///
/// `message_ids` should be the current members of the session's message
/// index. Returns the reply index of the primary-key delete.
pub(crate) fn queue_cascade_delete(pipe: &mut Pipeline, session_id: &str, message_ids: &[String]) -> usize {
    let primary = pipe.del(keys::session_key(session_id));
    pipe.srem(keys::SESSION_INDEX, session_id);
    for message_id in message_ids {
        pipe.del(keys::message_key(session_id, message_id));
    }
    pipe.del(keys::session_messages_key(session_id));
    pipe.del(keys::session_messages_index_key(session_id));
    primary
}

/// Drop every cached read that could mention `session_id`
pub(crate) fn invalidate_session(cache: &Cache, session_id: &str) {
    cache.remove(&keys::session_cache_key(session_id));
    cache.remove(keys::CACHE_ACTIVE_SESSIONS);
    cache.clear(Some(&keys::messages_cache_scope(session_id)));
}

/// CRUD, search and maintenance over sessions
#[derive(Debug, Clone)]
pub struct SessionManager {
    client: StoreClient,
    cache: Cache,
}

impl SessionManager {
    pub fn new(client: StoreClient, cache: Cache) -> Self {
        Self { client, cache }
    }

    /// Create a session; fails if the id is taken
    pub async fn create_session(
        &self,
        session_id: &str,
        metadata: Option<Metadata>,
        ttl: Option<u64>,
    ) -> Response<Session> {
        Response::from_result(
            "create session",
            self.try_create(session_id, metadata, ttl).await,
        )
    }

    async fn try_create(
        &self,
        session_id: &str,
        metadata: Option<Metadata>,
        ttl: Option<u64>,
    ) -> StorageResult<Session> {
        keys::validate_segment("session id", session_id)?;
        let session = Session::new(session_id, metadata.unwrap_or_default(), ttl);
        let payload = serde_json::to_string(&session).map_err(StorageError::serialize)?;

        let written = self
            .client
            .set_with(
                &keys::session_key(session_id),
                &payload,
                Expiry::from_ttl(ttl),
                SetCondition::IfAbsent,
            )
            .await?;
        if !written {
            return Err(StorageError::AlreadyExists(describe(session_id)));
        }
        self.client.sadd(keys::SESSION_INDEX, session_id).await?;

        invalidate_session(&self.cache, session_id);
        info!(session_id = %session_id, ttl = ?ttl, "Session created");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Response<Session> {
        Response::from_result("get session", self.try_get(session_id).await)
    }

    async fn try_get(&self, session_id: &str) -> StorageResult<Session> {
        keys::validate_segment("session id", session_id)?;
        let cache_key = keys::session_cache_key(session_id);
        if let Some(session) = self.cache.get::<Session>(&cache_key) {
            debug!(session_id = %session_id, "Session cache hit");
            return Ok(session);
        }

        let session: Session = self
            .client
            .get_json(&keys::session_key(session_id))
            .await?
            .ok_or_else(|| StorageError::NotFound(describe(session_id)))?;
        self.cache.set(&cache_key, &session, None)?;
        Ok(session)
    }

    /// List sessions, optionally filtered by an id substring
    ///
    /// Ids are returned in lexical order; `limit` of `None` or zero means
    /// unbounded.
    pub async fn list_sessions(&self, pattern: Option<&str>, limit: Option<usize>) -> Response<Vec<Session>> {
        Response::from_list("list sessions", self.try_list(pattern, limit).await)
    }

    async fn try_list(&self, pattern: Option<&str>, limit: Option<usize>) -> StorageResult<Vec<Session>> {
        let ids = match pattern.filter(|p| !p.is_empty()) {
            Some(pattern) => self.ids_matching(pattern).await?,
            None => {
                let mut ids = self.client.smembers(keys::SESSION_INDEX).await?;
                ids.sort();
                ids
            }
        };
        self.fetch(ids, limit).await
    }

    /// Session ids whose primary key contains `text`
    async fn ids_matching(&self, text: &str) -> StorageResult<Vec<String>> {
        let glob = format!("{}:*{}*", keys::SESSION, keys::escape_glob(text));
        let mut ids: Vec<String> = self
            .client
            .keys(&glob)
            .await?
            .iter()
            .filter_map(|k| keys::parse_session_key(k))
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn fetch(&self, mut ids: Vec<String>, limit: Option<usize>) -> StorageResult<Vec<Session>> {
        if let Some(limit) = limit.filter(|l| *l > 0) {
            ids.truncate(limit);
        }
        let full_keys: Vec<String> = ids.iter().map(|id| keys::session_key(id)).collect();
        self.client.get_json_many(&full_keys).await
    }

    /// Merge metadata into a session, keeping its remaining TTL
    pub async fn update_session(&self, session_id: &str, updates: Metadata) -> Response<Session> {
        Response::from_result("update session", self.try_update(session_id, updates).await)
    }

    async fn try_update(&self, session_id: &str, updates: Metadata) -> StorageResult<Session> {
        keys::validate_segment("session id", session_id)?;
        let session_key = keys::session_key(session_id);
        let mut session: Session = self
            .client
            .get_json(&session_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(describe(session_id)))?;
        session.merge_metadata(updates);

        let payload = serde_json::to_string(&session).map_err(StorageError::serialize)?;
        let written = self
            .client
            .set_with(&session_key, &payload, Expiry::Keep, SetCondition::IfPresent)
            .await?;
        if !written {
            return Err(StorageError::NotFound(describe(session_id)));
        }

        invalidate_session(&self.cache, session_id);
        debug!(session_id = %session_id, "Session updated");
        Ok(session)
    }

    /// Delete a session together with all of its messages
    pub async fn delete_session(&self, session_id: &str) -> Response<bool> {
        Response::from_result("delete session", self.try_delete(session_id).await)
    }

    async fn try_delete(&self, session_id: &str) -> StorageResult<bool> {
        keys::validate_segment("session id", session_id)?;
        if !self.client.exists(&keys::session_key(session_id)).await? {
            return Err(StorageError::NotFound(describe(session_id)));
        }
        let message_ids = self
            .client
            .smembers(&keys::session_messages_index_key(session_id))
            .await?;

        let mut pipe = self.client.pipeline();
        let primary = queue_cascade_delete(&mut pipe, session_id, &message_ids);
        let replies = self.client.execute(pipe).await?;
        if replies[primary].clone().into_integer()? == 0 {
            return Err(StorageError::NotFound(describe(session_id)));
        }

        invalidate_session(&self.cache, session_id);
        info!(session_id = %session_id, messages = message_ids.len(), "Session deleted");
        Ok(true)
    }

    /// Sessions updated within the last hour
    ///
    /// The result is cached for five minutes.
    pub async fn get_active_sessions(&self) -> Response<Vec<Session>> {
        Response::from_list("get active sessions", self.try_active().await)
    }

    async fn try_active(&self) -> StorageResult<Vec<Session>> {
        if let Some(sessions) = self.cache.get::<Vec<Session>>(keys::CACHE_ACTIVE_SESSIONS) {
            return Ok(sessions);
        }

        let mut ids = self.client.smembers(keys::SESSION_INDEX).await?;
        ids.sort();
        let cutoff = Utc::now() - ChronoDuration::minutes(ACTIVE_WINDOW_MINUTES);
        let active: Vec<Session> = self
            .fetch(ids, None)
            .await?
            .into_iter()
            .filter(|s| s.is_active_since(cutoff))
            .collect();

        self.cache
            .set(keys::CACHE_ACTIVE_SESSIONS, &active, Some(ACTIVE_CACHE_TTL))?;
        Ok(active)
    }

    /// Sessions whose id contains `query`
    pub async fn search_sessions(&self, query: &str, limit: Option<usize>) -> Response<Vec<Session>> {
        Response::from_list("search sessions", self.try_search(query, limit).await)
    }

    async fn try_search(&self, query: &str, limit: Option<usize>) -> StorageResult<Vec<Session>> {
        let ids = self.ids_matching(query).await?;
        self.fetch(ids, limit).await
    }

    /// Count indexed sessions by liveness
    pub async fn get_session_stats(&self) -> Response<SessionStats> {
        Response::from_result("get session stats", self.try_stats().await)
    }

    async fn try_stats(&self) -> StorageResult<SessionStats> {
        let statuses = self.indexed_ttls().await?;
        let expired = statuses.iter().filter(|(_, ttl)| ttl.is_missing()).count();
        Ok(SessionStats {
            total: statuses.len(),
            active: statuses.len() - expired,
            expired,
        })
    }

    async fn indexed_ttls(&self) -> StorageResult<Vec<(String, TtlStatus)>> {
        let ids = self.client.smembers(keys::SESSION_INDEX).await?;
        let mut pipe = self.client.pipeline();
        for id in &ids {
            pipe.ttl(keys::session_key(id));
        }
        let replies = self.client.execute(pipe).await?;
        ids.into_iter()
            .zip(replies)
            .map(|(id, reply)| Ok((id, TtlStatus::from_raw(reply.into_integer()?))))
            .collect()
    }

    /// Drop index entries of sessions that have expired
    ///
    /// The message structures such sessions owned are removed too.
    ///
    /// # Returns
    ///
    /// Number of sessions cleaned up
    pub async fn cleanup_expired_sessions(&self) -> Response<usize> {
        Response::from_count("cleanup expired sessions", self.try_cleanup().await)
    }

    async fn try_cleanup(&self) -> StorageResult<usize> {
        let expired: Vec<String> = self
            .indexed_ttls()
            .await?
            .into_iter()
            .filter(|(_, ttl)| ttl.is_missing())
            .map(|(id, _)| id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let mut pipe = self.client.pipeline();
        for id in &expired {
            let message_ids = self
                .client
                .smembers(&keys::session_messages_index_key(id))
                .await?;
            queue_cascade_delete(&mut pipe, id, &message_ids);
        }
        self.client.execute(pipe).await?;

        for id in &expired {
            invalidate_session(&self.cache, id);
        }
        info!(cleaned = expired.len(), "Expired sessions cleaned up");
        Ok(expired.len())
    }
}
