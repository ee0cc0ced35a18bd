//! Messages within a session
//!
//! A message lives at `s:<sid>:m:<mid>`. Its id is pushed onto the session's
//! ordered list `s:<sid>:ms` (newest first, used for pagination) and added to
//! the unordered set `s:<sid>:ms:index` (used for search and bulk reads).
//! Messages carry no TTL of their own.

use crate::cache::Cache;
use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::search::TextFilter;
use crate::store::{Expiry, SetCondition, StoreClient};
use crate::types::{Metadata, Paginated, Response};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Page size used when the caller gives none
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Default look-back window for [`MessageManager::get_recent_messages`]
pub const DEFAULT_RECENT_HOURS: u32 = 24;

const RECENT_CACHE_TTL: u64 = 300;

/// One conversational turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            session_id: session_id.into(),
            role: role.into(),
            content: content.into(),
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn storage_key(&self) -> String {
        keys::message_key(&self.session_id, &self.message_id)
    }

    fn matches(&self, filter: &TextFilter) -> bool {
        let metadata = serde_json::to_string(&self.metadata).unwrap_or_default();
        filter.matches_any([self.content.as_str(), self.role.as_str(), metadata.as_str()])
    }
}

/// Generate an id of the form `msg_<unix-millis>_<9 hex chars>`
pub fn generate_message_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Partial update of a message
///
/// Absent fields are left untouched; metadata is merged key by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MessageUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Apply to `message`, bumping `updated_at`
    pub fn apply(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(role) = self.role {
            message.role = role;
        }
        if let Some(metadata) = self.metadata {
            message.metadata.extend(metadata);
        }
        message.updated_at = Utc::now();
    }
}

pub(crate) fn validate_ids(session_id: &str, message_id: &str) -> StorageResult<()> {
    keys::validate_segment("session id", session_id)?;
    keys::validate_segment("message id", message_id)
}

fn describe(session_id: &str, message_id: &str) -> String {
    format!("message '{}' in session '{}'", message_id, session_id)
}

/// Newest first, ties broken by id for a stable order
fn sort_newest_first(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.message_id.cmp(&a.message_id))
    });
}

/// CRUD, pagination and search over messages
#[derive(Debug, Clone)]
pub struct MessageManager {
    client: StoreClient,
    cache: Cache,
}

impl MessageManager {
    pub fn new(client: StoreClient, cache: Cache) -> Self {
        Self { client, cache }
    }

    async fn require_session(&self, session_id: &str) -> StorageResult<()> {
        keys::validate_segment("session id", session_id)?;
        if self.client.exists(&keys::session_key(session_id)).await? {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("session '{}'", session_id)))
        }
    }

    fn invalidate(&self, session_id: &str) {
        self.cache.clear(Some(&keys::messages_cache_scope(session_id)));
    }

    /// Append a message to an existing session
    pub async fn create_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Metadata>,
    ) -> Response<Message> {
        Response::from_result(
            "create message",
            self.try_create(session_id, role, content, metadata).await,
        )
    }

    async fn try_create(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Metadata>,
    ) -> StorageResult<Message> {
        self.require_session(session_id).await?;

        let message = Message::new(
            generate_message_id(),
            session_id,
            role,
            content,
            metadata.unwrap_or_default(),
        );
        let payload = serde_json::to_string(&message).map_err(StorageError::serialize)?;
        let written = self
            .client
            .set_with(
                &message.storage_key(),
                &payload,
                Expiry::Persist,
                SetCondition::IfAbsent,
            )
            .await?;
        if !written {
            return Err(StorageError::AlreadyExists(describe(session_id, &message.message_id)));
        }

        let mut pipe = self.client.pipeline();
        pipe.lpush(keys::session_messages_key(session_id), message.message_id.as_str());
        pipe.sadd(keys::session_messages_index_key(session_id), message.message_id.as_str());
        self.client.execute(pipe).await?;

        self.invalidate(session_id);
        debug!(session_id = %session_id, message_id = %message.message_id, "Message created");
        Ok(message)
    }

    pub async fn get_message(&self, session_id: &str, message_id: &str) -> Response<Message> {
        Response::from_result("get message", self.try_get(session_id, message_id).await)
    }

    async fn try_get(&self, session_id: &str, message_id: &str) -> StorageResult<Message> {
        validate_ids(session_id, message_id)?;
        let cache_key = keys::message_cache_key(session_id, message_id);
        if let Some(message) = self.cache.get::<Message>(&cache_key) {
            return Ok(message);
        }

        let message: Message = self
            .client
            .get_json(&keys::message_key(session_id, message_id))
            .await?
            .ok_or_else(|| StorageError::NotFound(describe(session_id, message_id)))?;
        self.cache.set(&cache_key, &message, None)?;
        Ok(message)
    }

    /// One page of a session's messages, newest first
    ///
    /// `limit` of `None` or zero means [`DEFAULT_PAGE_SIZE`]; `offset`
    /// defaults to zero.
    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Response<Paginated<Message>> {
        Response::from_result(
            "get messages",
            self.try_page(session_id, limit, offset).await,
        )
    }

    async fn try_page(
        &self,
        session_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> StorageResult<Paginated<Message>> {
        keys::validate_segment("session id", session_id)?;
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = offset.unwrap_or(0);

        let cache_key = keys::page_cache_key(session_id, limit, offset);
        if let Some(page) = self.cache.get::<Paginated<Message>>(&cache_key) {
            return Ok(page);
        }

        self.require_session(session_id).await?;
        let list_key = keys::session_messages_key(session_id);
        let total = self.client.llen(&list_key).await?;

        let end = offset.saturating_add(limit);
        let has_more = end < total;
        let items = if offset >= total {
            Vec::new()
        } else {
            let start = i64::try_from(offset).unwrap_or(i64::MAX);
            let stop = i64::try_from(end.min(total) - 1).unwrap_or(i64::MAX);
            let ids = self.client.lrange(&list_key, start, stop).await?;
            let full_keys: Vec<String> = ids
                .iter()
                .map(|id| keys::message_key(session_id, id))
                .collect();
            self.client.get_json_many(&full_keys).await?
        };

        let page = Paginated {
            items,
            total,
            limit,
            offset,
            has_more,
        };
        self.cache.set(&cache_key, &page, None)?;
        Ok(page)
    }

    async fn load_all(&self, session_id: &str) -> StorageResult<Vec<Message>> {
        let ids = self
            .client
            .smembers(&keys::session_messages_index_key(session_id))
            .await?;
        let full_keys: Vec<String> = ids
            .iter()
            .map(|id| keys::message_key(session_id, id))
            .collect();
        let mut messages: Vec<Message> = self.client.get_json_many(&full_keys).await?;
        sort_newest_first(&mut messages);
        Ok(messages)
    }

    /// Messages whose content, role or metadata contain `query`, ignoring
    /// case, newest first
    pub async fn search_messages(
        &self,
        session_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Response<Vec<Message>> {
        Response::from_list(
            "search messages",
            self.try_search(session_id, query, limit).await,
        )
    }

    async fn try_search(
        &self,
        session_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> StorageResult<Vec<Message>> {
        self.require_session(session_id).await?;
        let filter = TextFilter::new(query)?;
        let mut matches: Vec<Message> = self
            .load_all(session_id)
            .await?
            .into_iter()
            .filter(|m| m.matches(&filter))
            .collect();
        if let Some(limit) = limit.filter(|l| *l > 0) {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    pub async fn update_message(
        &self,
        session_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Response<Message> {
        Response::from_result(
            "update message",
            self.try_update(session_id, message_id, update).await,
        )
    }

    async fn try_update(
        &self,
        session_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> StorageResult<Message> {
        validate_ids(session_id, message_id)?;
        let message_key = keys::message_key(session_id, message_id);
        let mut message: Message = self
            .client
            .get_json(&message_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(describe(session_id, message_id)))?;
        update.apply(&mut message);

        let payload = serde_json::to_string(&message).map_err(StorageError::serialize)?;
        let written = self
            .client
            .set_with(&message_key, &payload, Expiry::Keep, SetCondition::IfPresent)
            .await?;
        if !written {
            return Err(StorageError::NotFound(describe(session_id, message_id)));
        }

        self.invalidate(session_id);
        Ok(message)
    }

    pub async fn delete_message(&self, session_id: &str, message_id: &str) -> Response<bool> {
        Response::from_result("delete message", self.try_delete(session_id, message_id).await)
    }

    async fn try_delete(&self, session_id: &str, message_id: &str) -> StorageResult<bool> {
        validate_ids(session_id, message_id)?;
        if !self.client.del(&keys::message_key(session_id, message_id)).await? {
            return Err(StorageError::NotFound(describe(session_id, message_id)));
        }
        let mut pipe = self.client.pipeline();
        pipe.lrem(keys::session_messages_key(session_id), 1, message_id);
        pipe.srem(keys::session_messages_index_key(session_id), message_id);
        self.client.execute(pipe).await?;

        self.invalidate(session_id);
        Ok(true)
    }

    /// Remove every message of a session, keeping the session itself
    ///
    /// # Returns
    ///
    /// Number of messages removed
    pub async fn delete_all_messages(&self, session_id: &str) -> Response<usize> {
        Response::from_count("delete all messages", self.try_delete_all(session_id).await)
    }

    async fn try_delete_all(&self, session_id: &str) -> StorageResult<usize> {
        self.require_session(session_id).await?;
        let index_key = keys::session_messages_index_key(session_id);
        let ids = self.client.smembers(&index_key).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = self.client.pipeline();
        for id in &ids {
            pipe.del(keys::message_key(session_id, id));
        }
        pipe.del(keys::session_messages_key(session_id));
        pipe.del(index_key);
        self.client.execute(pipe).await?;

        self.invalidate(session_id);
        info!(session_id = %session_id, removed = ids.len(), "Session messages cleared");
        Ok(ids.len())
    }

    pub async fn get_message_count(&self, session_id: &str) -> Response<usize> {
        Response::from_count("get message count", self.try_count(session_id).await)
    }

    async fn try_count(&self, session_id: &str) -> StorageResult<usize> {
        self.require_session(session_id).await?;
        self.client.llen(&keys::session_messages_key(session_id)).await
    }

    /// Messages created within the last `hours`, newest first
    ///
    /// The result is cached for five minutes.
    pub async fn get_recent_messages(&self, session_id: &str, hours: Option<u32>) -> Response<Vec<Message>> {
        let hours = hours.unwrap_or(DEFAULT_RECENT_HOURS);
        Response::from_list("get recent messages", self.try_recent(session_id, hours).await)
    }

    async fn try_recent(&self, session_id: &str, hours: u32) -> StorageResult<Vec<Message>> {
        keys::validate_segment("session id", session_id)?;
        let cache_key = keys::recent_cache_key(session_id, hours);
        if let Some(messages) = self.cache.get::<Vec<Message>>(&cache_key) {
            return Ok(messages);
        }

        self.require_session(session_id).await?;
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(hours));
        let recent: Vec<Message> = self
            .load_all(session_id)
            .await?
            .into_iter()
            .filter(|m| m.created_at > cutoff)
            .collect();

        self.cache.set(&cache_key, &recent, Some(RECENT_CACHE_TTL))?;
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> (MessageManager, StoreClient) {
        let client = StoreClient::in_memory();
        client.connect().await.unwrap();
        client.set("s:abc", r#"{"sessionId":"abc"}"#, None).await.unwrap();
        (MessageManager::new(client.clone(), Cache::default()), client)
    }

    #[test]
    fn test_generated_id_format() {
        let id = generate_message_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "msg");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(generate_message_id(), id);
    }

    #[test]
    fn test_update_is_partial() {
        let mut message = Message::new("m1", "abc", "user", "hi", Metadata::new());
        message.metadata.insert("lang".into(), json!("en"));

        let mut extra = Metadata::new();
        extra.insert("edited".into(), json!(true));
        MessageUpdate::content("hello").with_metadata(extra).apply(&mut message);

        assert_eq!(message.content, "hello");
        assert_eq!(message.role, "user");
        assert_eq!(message.metadata["lang"], json!("en"));
        assert_eq!(message.metadata["edited"], json!(true));
    }

    #[tokio::test]
    async fn test_create_requires_session() {
        let (messages, _) = setup().await;
        let response = messages.create_message("ghost", "user", "hi", None).await;
        assert!(response.error_message().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_create_indexes_message() {
        let (messages, client) = setup().await;
        let created = messages
            .create_message("abc", "user", "hi", None)
            .await
            .into_result()
            .unwrap();

        let id = created.message_id.clone();
        assert_eq!(client.lrange("s:abc:ms", 0, -1).await.unwrap(), vec![id.clone()]);
        assert_eq!(client.smembers("s:abc:ms:index").await.unwrap(), vec![id.clone()]);

        let fetched = messages.get_message("abc", &id).await.into_result().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_pagination() {
        let (messages, _) = setup().await;
        let mut ids = Vec::new();
        for i in 0..120 {
            let m = messages
                .create_message("abc", "user", &format!("message {}", i), None)
                .await
                .into_result()
                .unwrap();
            ids.push(m.message_id);
        }

        let first = messages.get_messages("abc", Some(50), Some(0)).await.into_result().unwrap();
        assert_eq!(first.items.len(), 50);
        assert_eq!(first.total, 120);
        assert!(first.has_more);
        assert_eq!(first.items[0].message_id, ids[119]);
        assert_eq!(first.items[49].message_id, ids[70]);

        let last = messages.get_messages("abc", Some(50), Some(100)).await.into_result().unwrap();
        assert_eq!(last.items.len(), 20);
        assert!(!last.has_more);
        assert_eq!(last.items[19].message_id, ids[0]);

        let beyond = messages.get_messages("abc", None, Some(500)).await.into_result().unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.limit, DEFAULT_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_pagination_with_extreme_bounds() {
        let (messages, _) = setup().await;
        for i in 0..3 {
            messages.create_message("abc", "user", &i.to_string(), None).await;
        }

        let huge_limit = messages.get_messages("abc", Some(usize::MAX), Some(1)).await;
        let page = huge_limit.into_result().unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(!page.has_more);

        let huge_offset = messages.get_messages("abc", None, Some(usize::MAX)).await;
        let page = huge_offset.into_result().unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 3);

        let both = messages.get_messages("abc", Some(usize::MAX), Some(usize::MAX)).await;
        assert!(both.is_success());
    }

    #[tokio::test]
    async fn test_page_cache_invalidated_by_new_message() {
        let (messages, _) = setup().await;
        messages.create_message("abc", "user", "one", None).await;
        let page = messages.get_messages("abc", None, None).await.into_result().unwrap();
        assert_eq!(page.total, 1);

        messages.create_message("abc", "user", "two", None).await;
        let page = messages.get_messages("abc", None, None).await.into_result().unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].content, "two");
    }

    #[tokio::test]
    async fn test_search_messages() {
        let (messages, _) = setup().await;
        let mut meta = Metadata::new();
        meta.insert("topic".into(), json!("Billing"));
        messages.create_message("abc", "user", "Where is my REFUND?", None).await;
        messages.create_message("abc", "assistant", "Checking now", Some(meta)).await;
        messages.create_message("abc", "user", "thanks", None).await;

        let refund = messages.search_messages("abc", "refund", None).await;
        assert_eq!(refund.count, Some(1));

        let by_role = messages.search_messages("abc", "ASSISTANT", None).await;
        assert_eq!(by_role.count, Some(1));

        let by_meta = messages.search_messages("abc", "billing", None).await;
        assert_eq!(by_meta.count, Some(1));

        let limited = messages.search_messages("abc", "user", Some(1)).await;
        assert_eq!(limited.count, Some(1));
    }

    #[tokio::test]
    async fn test_search_folds_non_ascii_case() {
        let (messages, _) = setup().await;
        messages.create_message("abc", "user", "ÉCOLE ouverte", None).await;
        messages.create_message("abc", "user", "closed", None).await;

        let found = messages.search_messages("abc", "école", None).await;
        assert_eq!(found.count, Some(1));
        let upper = messages.search_messages("abc", "OUVERTE", None).await;
        assert_eq!(upper.count, Some(1));
    }

    #[tokio::test]
    async fn test_ids_with_separator_rejected() {
        let (messages, client) = setup().await;
        let m = messages.create_message("abc", "user", "hi", None).await.into_result().unwrap();

        let deleted = messages.delete_message("abc:ms", "index").await;
        assert!(deleted.error_message().unwrap().contains("Invalid input"));
        assert!(!messages.get_message("abc", "m:x").await.is_success());
        assert!(!messages
            .update_message("abc", "", MessageUpdate::content("x"))
            .await
            .is_success());
        assert!(!messages.delete_all_messages("abc:m").await.is_success());
        assert!(!messages.get_messages("abc:ms", None, None).await.is_success());

        assert_eq!(
            client.smembers("s:abc:ms:index").await.unwrap(),
            vec![m.message_id.clone()]
        );
        assert_eq!(messages.get_message_count("abc").await.data, Some(1));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (messages, client) = setup().await;
        let m = messages
            .create_message("abc", "user", "draft", None)
            .await
            .into_result()
            .unwrap();

        let updated = messages
            .update_message("abc", &m.message_id, MessageUpdate::content("final"))
            .await
            .into_result()
            .unwrap();
        assert_eq!(updated.content, "final");
        assert_eq!(
            messages.get_message("abc", &m.message_id).await.into_result().unwrap().content,
            "final"
        );

        assert!(messages.delete_message("abc", &m.message_id).await.is_success());
        assert_eq!(client.llen("s:abc:ms").await.unwrap(), 0);
        assert!(client.smembers("s:abc:ms:index").await.unwrap().is_empty());
        assert!(!messages.get_message("abc", &m.message_id).await.is_success());
        assert!(!messages.delete_message("abc", &m.message_id).await.is_success());
        assert!(!messages
            .update_message("abc", &m.message_id, MessageUpdate::default())
            .await
            .is_success());
    }

    #[tokio::test]
    async fn test_delete_all_and_count() {
        let (messages, client) = setup().await;
        for i in 0..3 {
            messages.create_message("abc", "user", &i.to_string(), None).await;
        }
        assert_eq!(messages.get_message_count("abc").await.data, Some(3));

        assert_eq!(messages.delete_all_messages("abc").await.data, Some(3));
        assert_eq!(messages.get_message_count("abc").await.data, Some(0));
        assert!(client.exists("s:abc").await.unwrap());
        assert!(client.keys("s:abc:m:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_messages_newest_first() {
        let (messages, client) = setup().await;
        let mut old = Message::new("old", "abc", "user", "ancient", Metadata::new());
        old.created_at = Utc::now() - ChronoDuration::hours(48);
        client
            .set(&old.storage_key(), &serde_json::to_string(&old).unwrap(), None)
            .await
            .unwrap();
        client.sadd("s:abc:ms:index", "old").await.unwrap();

        let first = messages.create_message("abc", "user", "first", None).await.into_result().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = messages.create_message("abc", "user", "second", None).await.into_result().unwrap();

        let recent = messages.get_recent_messages("abc", None).await.into_result().unwrap();
        let ids: Vec<&str> = recent.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec![second.message_id.as_str(), first.message_id.as_str()]);

        let wide = messages.get_recent_messages("abc", Some(72)).await;
        assert_eq!(wide.count, Some(3));
    }
}
