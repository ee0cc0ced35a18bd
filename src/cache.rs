//! Process-local read cache
//!
//! A bounded, TTL-aware map in front of the store. Values are held as JSON
//! so one cache serves every entity type. Entries expire lazily on read and
//! eagerly through [`Cache::sweep`], which [`Cache::spawn_sweeper`] runs on
//! an interval.
//!
//! The cache is advisory: it is never consulted for writes and a miss always
//! falls through to the store.

use crate::config::CacheConfig;
use crate::error::{StorageError, StorageResult};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Counters tracking cache effectiveness
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate between 0.0 and 1.0 (0.0 before any lookup)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0
        )
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Shared read cache
///
/// Cloning is cheap; clones share entries and statistics.
#[derive(Debug, Clone)]
pub struct Cache {
    entries: Arc<Mutex<LruCache<String, CacheEntry>>>,
    stats: Arc<CacheStats>,
    default_ttl: Duration,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            stats: Arc::new(CacheStats::default()),
            default_ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a value; `ttl` of `None` uses the configured default
    ///
    /// An entry stays live up to and including the instant its TTL elapses.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) -> StorageResult<()> {
        let value = serde_json::to_value(value).map_err(StorageError::serialize)?;
        let ttl = ttl.map(Duration::from_secs).unwrap_or(self.default_ttl);
        self.lock().put(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Fetch a live value
    ///
    /// Expired entries are removed and count as a miss. So does an entry
    /// that no longer decodes as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let value = {
            let mut entries = self.lock();
            match entries.get(key) {
                Some(entry) if now <= entry.expires_at => Some(entry.value.clone()),
                Some(_) => {
                    entries.pop(key);
                    None
                }
                None => None,
            }
        };

        let Some(value) = value else {
            self.stats.record_miss();
            return None;
        };
        match serde_json::from_value(value) {
            Ok(decoded) => {
                self.stats.record_hit();
                Some(decoded)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.lock().pop(key);
                self.stats.record_miss();
                None
            }
        }
    }

    /// Remove one entry, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Remove every entry whose key contains `pattern`, or everything when
    /// `pattern` is `None`
    ///
    /// # Returns
    ///
    /// Number of entries removed
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.lock();
        let Some(pattern) = pattern else {
            let removed = entries.len();
            entries.clear();
            return removed;
        };
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.contains(pattern))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Drop every expired entry
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now > entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Run [`Cache::sweep`] every `interval` until the handle is aborted
    ///
    /// Intervals shorter than one second are raised to one second.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(?interval, "Sweep interval too short, using {:?}", MIN_SWEEP_INTERVAL);
        }
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }

    /// Entry count, including expired entries not yet swept
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = Cache::default();
        cache.set("k", &"v", Some(1)).unwrap();
        assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(cache.get::<String>("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_live_at_exact_ttl() {
        let cache = Cache::default();
        cache.set("k", &"v", Some(1)).unwrap();

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get::<String>("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_applies() {
        let config = CacheConfig {
            ttl_seconds: 10,
            ..CacheConfig::default()
        };
        let cache = Cache::new(&config);
        cache.set("k", &1u32, None).unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get::<u32>("k"), Some(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[test]
    fn test_clear_by_substring() {
        let cache = Cache::default();
        cache.set("ax", &1, None).unwrap();
        cache.set("bx", &2, None).unwrap();
        cache.set("c", &3, None).unwrap();

        assert_eq!(cache.clear(Some("x")), 2);
        assert_eq!(cache.get::<i32>("ax"), None);
        assert_eq!(cache.get::<i32>("bx"), None);
        assert_eq!(cache.get::<i32>("c"), Some(3));

        assert_eq!(cache.clear(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_typed_round_trip_and_stats() {
        let cache = Cache::default();
        let item = Item {
            name: "widget".into(),
        };
        cache.set("item", &item, None).unwrap();

        assert_eq!(cache.get::<Item>("item"), Some(item));
        assert_eq!(cache.get::<Item>("missing"), None);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert!((cache.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_undecodable_entry_is_dropped() {
        let cache = Cache::default();
        cache.set("k", &"not an item", None).unwrap();
        assert_eq!(cache.get::<Item>("k"), None);
        assert!(!cache.remove("k"));
    }

    #[test]
    fn test_lru_bound() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = Cache::new(&config);
        cache.set("a", &1, None).unwrap();
        cache.set("b", &2, None).unwrap();
        assert_eq!(cache.get::<i32>("a"), Some(1));
        cache.set("c", &3, None).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<i32>("b"), None);
        assert_eq!(cache.get::<i32>("a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Cache::default();
        cache.set("short", &1, Some(1)).unwrap();
        cache.set("long", &2, Some(600)).unwrap();

        let handle = cache.spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<i32>("long"), Some(2));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_is_raised() {
        let cache = Cache::default();
        cache.set("short", &1, Some(1)).unwrap();

        let handle = cache.spawn_sweeper(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(!handle.is_finished());
        assert!(cache.is_empty());
        handle.abort();
    }
}
