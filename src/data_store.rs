//! Top-level handle wiring the client, cache and managers together

use crate::batch::BatchEngine;
use crate::cache::Cache;
use crate::config::StoreConfig;
use crate::error::StorageResult;
use crate::info::InfoManager;
use crate::message::MessageManager;
use crate::session::SessionManager;
use crate::store::{KeyValueStore, MemoryStore, StoreClient};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// Owns one store connection, one cache and a manager per entity
///
/// All managers share the same client and cache, so a write through one is
/// visible (and invalidated) for the others.
///
/// # Example
///
/// ```no_run
/// use kvsession::DataStore;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = DataStore::builder().build();
/// store.start().await?;
///
/// store.sessions().create_session("abc", None, Some(3600)).await;
/// let page = store.messages().get_messages("abc", Some(20), None).await;
/// println!("{:?}", page.data);
///
/// store.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct DataStore {
    client: StoreClient,
    cache: Cache,
    config: StoreConfig,
    info: InfoManager,
    sessions: SessionManager,
    messages: MessageManager,
    batch: BatchEngine,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("client", &self.client)
            .field("cache_entries", &self.cache.len())
            .field("config", &self.config)
            .finish()
    }
}

impl DataStore {
    pub fn builder() -> DataStoreBuilder {
        DataStoreBuilder::new()
    }

    /// Store over a fresh in-memory backend with default settings
    pub fn in_memory() -> Self {
        Self::builder().build()
    }

    /// Connect and start cache housekeeping
    ///
    /// Fails if the backend cannot be reached within the configured connect
    /// timeout. Calling it again is harmless.
    pub async fn start(&self) -> StorageResult<()> {
        self.client.connect().await?;
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_none() {
            *sweeper = Some(self.cache.spawn_sweeper(self.config.cache.sweep_interval));
        }
        info!(
            host = %self.config.host,
            port = self.config.port,
            db = self.config.db,
            "Data store started"
        );
        Ok(())
    }

    /// Stop cache housekeeping and disconnect
    pub async fn shutdown(&self) -> StorageResult<()> {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.client.disconnect().await?;
        info!("Data store shut down");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn info(&self) -> &InfoManager {
        &self.info
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn messages(&self) -> &MessageManager {
        &self.messages
    }

    pub fn batch(&self) -> &BatchEngine {
        &self.batch
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

/// Builder for [`DataStore`]
pub struct DataStoreBuilder {
    config: StoreConfig,
    backend: Option<Arc<dyn KeyValueStore>>,
}

impl DataStoreBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
            backend: None,
        }
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Backend to use; defaults to a fresh [`MemoryStore`]
    pub fn backend(mut self, backend: Arc<dyn KeyValueStore>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Redis backend built from the configured host, port, password and db
    ///
    /// Only opens the client; the connection is made by [`DataStore::start`].
    #[cfg(feature = "redis-storage")]
    pub fn redis(self) -> StorageResult<Self> {
        let backend = crate::store::RedisStore::new(&self.config)?;
        Ok(self.backend(Arc::new(backend)))
    }

    pub fn build(self) -> DataStore {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let client = StoreClient::new(backend, &self.config);
        let cache = Cache::new(&self.config.cache);

        DataStore {
            info: InfoManager::new(client.clone(), cache.clone()),
            sessions: SessionManager::new(client.clone(), cache.clone()),
            messages: MessageManager::new(client.clone(), cache.clone()),
            batch: BatchEngine::new(client.clone(), cache.clone(), self.config.cache.batch_size),
            client,
            cache,
            config: self.config,
            sweeper: Mutex::new(None),
        }
    }
}

impl Default for DataStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    #[tokio::test]
    async fn test_operations_fail_before_start() {
        let store = DataStore::in_memory();
        let response = store.info().get_info("docs", "a").await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = DataStore::in_memory();
        store.start().await.unwrap();
        store.start().await.unwrap();
        assert!(store.is_connected());

        let created = store.sessions().create_session("abc", Some(Metadata::new()), None).await;
        assert!(created.success);

        store.shutdown().await.unwrap();
        assert!(!store.is_connected());
        assert!(store.sweeper.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_managers_share_cache() {
        let store = DataStore::in_memory();
        store.start().await.unwrap();
        store.info().create_info("docs", "a", "alpha", None).await;
        store.info().get_info("docs", "a").await;
        assert!(!store.cache().is_empty());

        store
            .batch()
            .execute(vec![crate::batch::BatchOperation::update_info("docs", "a", "beta", None)])
            .await;
        let item = store.info().get_info("docs", "a").await.into_result().unwrap();
        assert_eq!(item.data, "beta");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_keeps_sweeper_running() {
        let mut config = StoreConfig::default();
        config.cache.sweep_interval = std::time::Duration::ZERO;
        let store = DataStore::builder().config(config).build();
        store.start().await.unwrap();

        store.cache().set("scratch", &1, Some(1)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

        let finished = store
            .sweeper
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.is_finished());
        assert_eq!(finished, Some(false));
        assert!(store.cache().is_empty());
        store.shutdown().await.unwrap();
    }
}
