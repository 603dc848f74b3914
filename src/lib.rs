//! # Resource Engine
//!
//! A two-tier resource store with write-back synchronization, etag-based
//! optimistic concurrency and cross-process change notification.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ResourceEngine                         │
//! │  • get / put / compute / delete / copy / list / stream      │
//! │  • Per-key locks serialize every mutation                   │
//! │  • One ResourceEvent published per successful mutation      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Fast Tier (Redis or memory)                 │
//! │  • One field hash per resource, bodies up to max_size       │
//! │  • Dirty records queued in a sorted set by due time         │
//! │  • Synced records and tombstones expire after a TTL         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (Sync worker, every sync_period)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Durable Tier (SQLite/MySQL or memory)          │
//! │  • Source of truth once synced                              │
//! │  • Oversized bodies written here directly                   │
//! │  • Folder listings read only from here                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use resource_engine::{EtagPrecondition, ResourceEngine, ResourceEngineConfig};
//! use resource_engine::resource::ResourceDescriptor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ResourceEngineConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         sql_url: Some("sqlite://resources.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let engine = Arc::new(ResourceEngine::connect(config).await?);
//!     let worker = engine.start_sync_worker();
//!
//!     let desc = ResourceDescriptor::from_url("conversations/bucket/chat.json")?;
//!     let meta = engine.put_resource(&desc, b"{}".to_vec(), &EtagPrecondition::Any).await?;
//!
//!     // Only succeeds while nobody else changed it
//!     engine
//!         .put_resource(&desc, br#"{"title":"x"}"#.to_vec(), &EtagPrecondition::if_match(meta.etag))
//!         .await?;
//!
//!     assert!(worker.is_running());
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod resilience;
pub mod resource;
pub mod storage;
pub mod topic;

pub use config::ResourceEngineConfig;
pub use engine::{
    Backends, FolderEntry, FolderMetadata, ItemMetadata, ResourceContent, ResourceEngine, ResourceStream, SYNC_QUEUE,
    SyncReport, SyncWorkerHandle,
};
pub use error::{ResourceError, Result};
pub use lock::{lock_pair, InMemoryLockService, LockError, LockGuard, LockService, RedisLockService};
pub use crate::metrics::LatencyTimer;
pub use resilience::retry::RetryConfig;
pub use resource::{EtagPrecondition, ResourceDescriptor, ResourceKey, ResourceKind, ResourceMetadata};
pub use storage::traits::{DurableTier, FastTier, ScoredSet, StorageError};
pub use topic::{ChangeTopic, EventBus, LocalEventBus, RedisEventBus, ResourceAction, ResourceEvent, Subscription, TopicError};
