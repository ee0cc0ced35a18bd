//! Store and cache configuration
//!
//! Plain values handed in by whatever process hosts the store. Loading them
//! from the environment or files is left to the caller; every field has a
//! serde default so partial documents deserialize.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for the key-value store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub db: u32,

    /// Upper bound on the startup connect barrier
    #[serde(
        default = "default_connect_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Local cache and batching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied to cache entries inserted without an explicit one
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    /// Entries beyond this are evicted least-recently-used first
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(
        default = "default_sweep_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub sweep_interval: Duration,

    /// Preferred number of operations per batch for bulk callers
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_max_entries() -> usize {
    10_000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_batch_size() -> usize {
    100
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
            connect_timeout: default_connect_timeout(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
            max_entries: default_max_entries(),
            sweep_interval: default_sweep_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl StoreConfig {
    /// Connection URL in `redis://[:password@]host:port/db` form
    ///
    /// A blank password is treated as no password.
    pub fn redis_url(&self) -> String {
        match self.password.as_deref().map(str::trim) {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}
