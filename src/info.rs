//! Info items: freeform categorized records
//!
//! Each item lives at `i:<category>:<key>` and its key is a member of the
//! category index `c:<category>`. Reads go through the local cache; every
//! write invalidates the cached reads of its category.

use crate::cache::Cache;
use crate::error::{StorageError, StorageResult};
use crate::keys;
use crate::store::{Expiry, SetCondition, StoreClient};
use crate::types::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A freeform record addressed by `(category, key)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoItem {
    pub category: String,
    pub key: String,
    pub data: String,
    /// Lifetime in seconds requested at the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InfoItem {
    pub fn new(
        category: impl Into<String>,
        key: impl Into<String>,
        data: impl Into<String>,
        ttl: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            category: category.into(),
            key: key.into(),
            data: data.into(),
            ttl,
            created_at: now,
            updated_at: now,
        }
    }

    /// Primary key of this item
    pub fn storage_key(&self) -> String {
        keys::info_key(&self.category, &self.key)
    }

    /// Replace the payload and TTL, bumping `updated_at`
    pub fn replace_data(&mut self, data: impl Into<String>, ttl: Option<u64>) {
        self.data = data.into();
        self.ttl = ttl;
        self.updated_at = Utc::now();
    }
}

/// Summary of one category index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryInfo {
    pub category: String,
    pub count: usize,
    pub keys: Vec<String>,
}

pub(crate) fn validate_info_id(category: &str, key: &str) -> StorageResult<()> {
    keys::validate_segment("category", category)?;
    if key.is_empty() {
        return Err(StorageError::InvalidInput("info key must not be empty".to_string()));
    }
    Ok(())
}

fn describe(category: &str, key: &str) -> String {
    format!("info '{}' in category '{}'", key, category)
}

/// CRUD and search over info items
#[derive(Debug, Clone)]
pub struct InfoManager {
    client: StoreClient,
    cache: Cache,
}

impl InfoManager {
    pub fn new(client: StoreClient, cache: Cache) -> Self {
        Self { client, cache }
    }

    /// Create an item; fails if `(category, key)` already exists
    ///
    /// A TTL is applied to the item and also refreshed on the category index.
    pub async fn create_info(
        &self,
        category: &str,
        key: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> Response<InfoItem> {
        Response::from_result("create info", self.try_create(category, key, data, ttl).await)
    }

    async fn try_create(
        &self,
        category: &str,
        key: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> StorageResult<InfoItem> {
        validate_info_id(category, key)?;
        let item = InfoItem::new(category, key, data, ttl);
        let payload = serde_json::to_string(&item).map_err(StorageError::serialize)?;

        let written = self
            .client
            .set_with(
                &item.storage_key(),
                &payload,
                Expiry::from_ttl(ttl),
                SetCondition::IfAbsent,
            )
            .await?;
        if !written {
            return Err(StorageError::AlreadyExists(describe(category, key)));
        }

        let category_key = keys::category_key(category);
        self.client.sadd(&category_key, key).await?;
        if let Some(secs) = ttl.filter(|s| *s > 0) {
            self.client.expire(&category_key, secs).await?;
        }

        self.cache.clear(Some(&keys::info_cache_scope(category)));
        info!(category = %category, key = %key, "Info created");
        Ok(item)
    }

    pub async fn get_info(&self, category: &str, key: &str) -> Response<InfoItem> {
        Response::from_result("get info", self.try_get(category, key).await)
    }

    async fn try_get(&self, category: &str, key: &str) -> StorageResult<InfoItem> {
        validate_info_id(category, key)?;
        let cache_key = keys::info_cache_key(category, key);
        if let Some(item) = self.cache.get::<InfoItem>(&cache_key) {
            debug!(category = %category, key = %key, "Info cache hit");
            return Ok(item);
        }

        let item: InfoItem = self
            .client
            .get_json(&keys::info_key(category, key))
            .await?
            .ok_or_else(|| StorageError::NotFound(describe(category, key)))?;
        self.cache.set(&cache_key, &item, None)?;
        Ok(item)
    }

    /// List items in a category, or across all categories
    ///
    /// With a category the index is used and `pattern` filters keys by
    /// substring. Without one, `pattern` is matched against the whole
    /// primary key.
    pub async fn list_info(&self, category: Option<&str>, pattern: Option<&str>) -> Response<Vec<InfoItem>> {
        Response::from_list("list info", self.try_list(category, pattern).await)
    }

    async fn try_list(&self, category: Option<&str>, pattern: Option<&str>) -> StorageResult<Vec<InfoItem>> {
        let mut full_keys: Vec<String> = match category {
            Some(category) => {
                let mut members = self.client.smembers(&keys::category_key(category)).await?;
                if let Some(pattern) = pattern.filter(|p| !p.is_empty()) {
                    members.retain(|k| k.contains(pattern));
                }
                members
                    .iter()
                    .map(|k| keys::info_key(category, k))
                    .collect()
            }
            None => {
                let glob = match pattern.filter(|p| !p.is_empty()) {
                    Some(p) => format!("{}:*{}*", keys::INFO, keys::escape_glob(p)),
                    None => format!("{}:*", keys::INFO),
                };
                self.client.keys(&glob).await?
            }
        };
        full_keys.sort();
        self.client.get_json_many(&full_keys).await
    }

    /// Replace an item's data and TTL
    ///
    /// `ttl` of `None` makes the item persistent.
    pub async fn update_info(
        &self,
        category: &str,
        key: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> Response<InfoItem> {
        Response::from_result("update info", self.try_update(category, key, data, ttl).await)
    }

    async fn try_update(
        &self,
        category: &str,
        key: &str,
        data: &str,
        ttl: Option<u64>,
    ) -> StorageResult<InfoItem> {
        validate_info_id(category, key)?;
        let info_key = keys::info_key(category, key);
        let mut item: InfoItem = self
            .client
            .get_json(&info_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(describe(category, key)))?;
        item.replace_data(data, ttl);

        let payload = serde_json::to_string(&item).map_err(StorageError::serialize)?;
        let written = self
            .client
            .set_with(&info_key, &payload, Expiry::from_ttl(ttl), SetCondition::IfPresent)
            .await?;
        if !written {
            return Err(StorageError::NotFound(describe(category, key)));
        }

        self.cache.clear(Some(&keys::info_cache_scope(category)));
        debug!(category = %category, key = %key, "Info updated");
        Ok(item)
    }

    pub async fn delete_info(&self, category: &str, key: &str) -> Response<bool> {
        Response::from_result("delete info", self.try_delete(category, key).await)
    }

    async fn try_delete(&self, category: &str, key: &str) -> StorageResult<bool> {
        validate_info_id(category, key)?;
        if !self.client.del(&keys::info_key(category, key)).await? {
            return Err(StorageError::NotFound(describe(category, key)));
        }
        self.client.srem(&keys::category_key(category), key).await?;
        self.cache.clear(Some(&keys::info_cache_scope(category)));
        info!(category = %category, key = %key, "Info deleted");
        Ok(true)
    }

    /// Delete every item in a category along with its index
    ///
    /// # Returns
    ///
    /// Number of items removed
    pub async fn delete_category(&self, category: &str) -> Response<usize> {
        Response::from_count("delete category", self.try_delete_category(category).await)
    }

    async fn try_delete_category(&self, category: &str) -> StorageResult<usize> {
        keys::validate_segment("category", category)?;
        let category_key = keys::category_key(category);
        let members = self.client.smembers(&category_key).await?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut pipe = self.client.pipeline();
        let item_deletes: Vec<usize> = members
            .iter()
            .map(|k| pipe.del(keys::info_key(category, k)))
            .collect();
        pipe.del(category_key);
        let replies = self.client.execute(pipe).await?;

        let mut removed = 0;
        for idx in item_deletes {
            if replies[idx].clone().into_integer()? > 0 {
                removed += 1;
            }
        }

        self.cache.clear(Some(&keys::info_cache_scope(category)));
        info!(category = %category, removed, "Category deleted");
        Ok(removed)
    }

    pub async fn get_category_info(&self, category: &str) -> Response<CategoryInfo> {
        Response::from_result("get category info", self.try_category_info(category).await)
    }

    async fn try_category_info(&self, category: &str) -> StorageResult<CategoryInfo> {
        keys::validate_segment("category", category)?;
        let mut members = self.client.smembers(&keys::category_key(category)).await?;
        members.sort();
        Ok(CategoryInfo {
            category: category.to_string(),
            count: members.len(),
            keys: members,
        })
    }

    /// Find items whose primary key contains `query`
    pub async fn search_info(&self, query: &str, category: Option<&str>) -> Response<Vec<InfoItem>> {
        Response::from_list("search info", self.try_search(query, category).await)
    }

    async fn try_search(&self, query: &str, category: Option<&str>) -> StorageResult<Vec<InfoItem>> {
        let escaped = keys::escape_glob(query);
        let glob = match category {
            Some(c) => format!("{}:{}:*{}*", keys::INFO, keys::escape_glob(c), escaped),
            None => format!("{}:*{}*", keys::INFO, escaped),
        };
        let mut full_keys = self.client.keys(&glob).await?;
        full_keys.sort();
        self.client.get_json_many(&full_keys).await
    }
}
