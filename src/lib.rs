//! # kvsession - Structured data access over a key-value store
//!
//! kvsession stores three kinds of entity in a Redis-style key-value store:
//! categorized info items, sessions with free-form metadata, and the ordered
//! messages of each session. Reads go through a bounded local cache
//! (cache-aside); multi-entity mutations can be sent as one pipelined batch.
//!
//! ## Features
//!
//! - **Key space**: deterministic `i:`/`s:`/`c:` keys with secondary indexes
//! - **Race-safe writes**: create is `SET NX`, update is `SET XX`, session
//!   updates keep their TTL
//! - **Cascade delete**: deleting a session removes its messages and indexes
//! - **Batching**: one round trip, per-operation outcomes, duplicate and
//!   not-found detection
//! - **Backends**: in-memory by default, Redis behind the `redis-storage`
//!   feature
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvsession::{BatchOperation, DataStore, Metadata};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DataStore::in_memory();
//! store.start().await?;
//!
//! store.info().create_info("faq", "shipping", "Ships in 2 days", None).await;
//! store.sessions().create_session("abc", None, Some(3600)).await;
//! store.messages().create_message("abc", "user", "Where is my order?", None).await;
//!
//! let report = store
//!     .batch()
//!     .execute(vec![
//!         BatchOperation::create_info("faq", "returns", "30 days", None),
//!         BatchOperation::delete_session("stale"),
//!     ])
//!     .await;
//! println!("{:?}", report.data);
//! # Ok(())
//! # }
//! ```
//!
//! ## Key layout
//!
//! ```text
//! i:<category>:<key>          info item (JSON)
//! c:<category>                set of keys in a category
//! s:<sessionId>               session (JSON)
//! sessions:index              set of session ids
//! s:<sessionId>:m:<msgId>     message (JSON)
//! s:<sessionId>:ms            list of message ids, newest first
//! s:<sessionId>:ms:index      set of message ids
//! ```
//!
//! ## Module Overview
//!
//! - [`store`]: backend trait, client, typed commands and pipelines
//! - [`cache`]: bounded TTL cache shared by the managers
//! - [`keys`]: key builders and parsers
//! - [`info`], [`session`], [`message`]: entity managers
//! - [`batch`]: batch execution, bulk helpers and index cleanup
//! - [`config`]: store and cache settings
//! - [`error`]: error types and result aliases
//!
//! ## License
//!
//! Licensed under either of Apache License 2.0 or MIT license at your option.

// Core type definitions
pub mod types;

// Error types
pub mod error;

// Configuration
pub mod config;

// Key space
pub mod keys;

// Store backends and client
pub mod store;

// Local cache
pub mod cache;

// Text filtering for search
pub mod search;

// Entity managers
pub mod info;
pub mod message;
pub mod session;

// Batch engine
pub mod batch;

// Facade
pub mod data_store;

pub use batch::{
    BatchAction, BatchDescriptor, BatchEngine, BatchOperation, BatchOutcome, BatchReport,
    BatchResult, BatchStats, BulkCounts, CleanupReport, EntityKind, InfoInput, InfoOperation,
    MessageInput, MessageOperation, OperationSummary, SessionInput, SessionOperation,
};
pub use cache::{Cache, CacheStats};
pub use config::{CacheConfig, StoreConfig};
pub use data_store::{DataStore, DataStoreBuilder};
pub use error::{StorageError, StorageResult};
pub use info::{CategoryInfo, InfoItem, InfoManager};
pub use message::{Message, MessageManager, MessageUpdate};
pub use session::{Session, SessionManager, SessionStats};
pub use store::{KeyValueStore, MemoryStore, StoreClient};
pub use types::*;

#[cfg(feature = "redis-storage")]
pub use store::RedisStore;
