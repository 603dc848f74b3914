//! Resource engine: the two-tier store behind every resource API.
//!
//! The [`ResourceEngine`] ties together:
//! - the fast tier (one field hash per resource) used as cache and write-back staging
//! - the sync queue of dirty keys, scored by the time they become due
//! - the durable tier, the source of truth once a key is synced
//! - per-key locks serializing every mutation
//! - the change topic announcing every mutation
//!
//! # Record lifecycle
//!
//! ```text
//! put → Present{synced=false} + queued → sync tick → Present{synced=true} + TTL → expired
//! delete → Tombstone{synced=false} → durable delete → Tombstone{synced=true} + TTL
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use resource_engine::{EtagPrecondition, ResourceEngine, ResourceEngineConfig};
//! use resource_engine::resource::ResourceDescriptor;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ResourceEngine::in_memory(ResourceEngineConfig::default()).await?;
//! let desc = ResourceDescriptor::from_url("prompts/bucket/greeting.json")?;
//!
//! let meta = engine.put_resource(&desc, br#"{"text":"hi"}"#.to_vec(), &EtagPrecondition::Any).await?;
//! assert_eq!(engine.get_etag(&desc).await?, Some(meta.etag));
//! # Ok(())
//! # }
//! ```

mod copy;
mod read;
mod sync;
mod types;
mod write;

pub use sync::SyncWorkerHandle;
pub use types::{FolderEntry, FolderMetadata, ItemMetadata, ResourceContent, ResourceStream, SyncReport};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::compression;
use crate::config::ResourceEngineConfig;
use crate::error::{ResourceError, Result};
use crate::lock::{InMemoryLockService, LockService, RedisLockService};
use crate::metrics;
use crate::resource::{fields, now_millis, PresentRecord, ResourceDescriptor, ResourceKey, ResourceRecord};
use crate::storage::redis::connect as redis_connect;
use crate::storage::traits::{BlobWrite, DurableTier, FastTier, ScoredSet, StorageError};
use crate::storage::{InMemoryDurableTier, InMemoryFastTier, InMemoryScoredSet, RedisFastTier, RedisScoredSet, SqlDurableTier};
use crate::topic::{ChangeTopic, EventBus, LocalEventBus, RedisEventBus, ResourceAction, ResourceEvent};

/// Sorted set holding dirty keys, scored by due time.
pub const SYNC_QUEUE: &str = "resource:queue";

/// The collaborators an engine runs on.
#[derive(Clone)]
pub struct Backends {
    pub fast: Arc<dyn FastTier>,
    pub queue: Arc<dyn ScoredSet>,
    pub durable: Arc<dyn DurableTier>,
    pub locks: Arc<dyn LockService>,
    pub bus: Arc<dyn EventBus>,
}

impl Backends {
    /// Process-local backends for tests and single-replica deployments.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            fast: Arc::new(InMemoryFastTier::new()),
            queue: Arc::new(InMemoryScoredSet::new()),
            durable: Arc::new(InMemoryDurableTier::new()),
            locks: Arc::new(InMemoryLockService::new()),
            bus: Arc::new(LocalEventBus::default()),
        }
    }
}

pub struct ResourceEngine {
    pub(super) config: ResourceEngineConfig,
    pub(super) fast: Arc<dyn FastTier>,
    pub(super) queue: Arc<dyn ScoredSet>,
    pub(super) durable: Arc<dyn DurableTier>,
    pub(super) locks: Arc<dyn LockService>,
    pub(super) topic: ChangeTopic,
    pub(super) worker: Mutex<Option<SyncWorkerHandle>>,
}

impl ResourceEngine {
    pub async fn new(config: ResourceEngineConfig, backends: Backends) -> Result<Self> {
        let topic = ChangeTopic::start(backends.bus).await?;
        Ok(Self {
            config,
            fast: backends.fast,
            queue: backends.queue,
            durable: backends.durable,
            locks: backends.locks,
            topic,
            worker: Mutex::new(None),
        })
    }

    pub async fn in_memory(config: ResourceEngineConfig) -> Result<Self> {
        Self::new(config, Backends::in_memory()).await
    }

    /// Build backends from `redis_url` and `sql_url`.
    ///
    /// Without `redis_url` the fast tier, queue, locks and topic are
    /// process-local; without `sql_url` the durable tier is in memory.
    #[tracing::instrument(skip_all, fields(has_redis = config.redis_url.is_some(), has_sql = config.sql_url.is_some()))]
    pub async fn connect(config: ResourceEngineConfig) -> Result<Self> {
        let mut backends = Backends::in_memory();
        let prefix = config.redis_prefix.as_deref();

        if let Some(ref redis_url) = config.redis_url {
            info!("Connecting to Redis (fast tier, sync queue, locks, topic)...");
            let connection = redis_connect(redis_url).await?;
            let client = redis::Client::open(redis_url.as_str()).map_err(|e| StorageError::Backend(e.to_string()))?;
            let channel = format!("{}{}", config.prefix(), config.topic_channel);

            backends.fast = Arc::new(RedisFastTier::new(connection.clone(), prefix));
            backends.queue = Arc::new(RedisScoredSet::new(connection.clone(), prefix));
            backends.locks = Arc::new(RedisLockService::new(connection.clone(), prefix, config.lock_ttl()));
            backends.bus = Arc::new(RedisEventBus::new(client, connection, channel));
            info!("Redis connected");
        } else {
            warn!("No Redis URL configured - locks and events are local to this process");
        }

        if let Some(ref sql_url) = config.sql_url {
            info!("Connecting to SQL (durable tier)...");
            backends.durable = Arc::new(SqlDurableTier::new(sql_url).await?);
            info!("SQL connected");
        } else {
            warn!("No SQL URL configured - durable tier is in memory");
        }

        Self::new(config, backends).await
    }

    #[must_use]
    pub fn config(&self) -> &ResourceEngineConfig {
        &self.config
    }

    /// Bodies longer than this bypass the fast tier.
    #[must_use]
    pub fn get_max_size(&self) -> usize {
        self.config.max_size
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Fast tier and queue helpers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Read one record. A corrupt record reads as `Absent` so the caller
    /// falls back to the durable tier.
    pub(super) async fn read_record(&self, key: &ResourceKey, with_body: bool) -> Result<ResourceRecord> {
        let names = if with_body { fields::ALL } else { fields::METADATA };
        let map = self.fast.get_fields(key.as_str(), names).await?;
        match ResourceRecord::decode(key.as_str(), map) {
            Ok(record) => Ok(record),
            Err(StorageError::Corruption { key, reason }) => {
                warn!(key = %key, reason = %reason, "Corrupt fast-tier record, ignoring it");
                metrics::record_corruption(&key);
                Ok(ResourceRecord::Absent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the whole record. Synced records get the cache TTL, dirty
    /// ones stay until the sync worker reconciles them.
    pub(super) async fn write_record(&self, key: &ResourceKey, record: &ResourceRecord) -> Result<()> {
        let expiration = record.is_synced().then(|| self.config.cache_expiration());
        self.fast.replace_fields(key.as_str(), record.encode(), expiration).await?;
        Ok(())
    }

    /// Flip a written-back record to synced in place and start its TTL.
    pub(super) async fn mark_synced(&self, key: &ResourceKey) -> Result<()> {
        self.fast.update_fields(key.as_str(), ResourceRecord::synced_fields()).await?;
        self.fast.set_expiration(key.as_str(), self.config.cache_expiration()).await?;
        Ok(())
    }

    pub(super) async fn enqueue(&self, key: &ResourceKey) -> Result<()> {
        let due = now_millis().saturating_add(self.config.sync_delay_ms as i64);
        self.queue.add(SYNC_QUEUE, key.as_str(), due).await?;
        Ok(())
    }

    pub(super) async fn dequeue(&self, key: &ResourceKey) -> Result<()> {
        self.queue.remove(SYNC_QUEUE, key.as_str()).await?;
        Ok(())
    }

    /// Write `record`'s content to the durable tier, compressing non-file bodies.
    pub(super) async fn store_durable(&self, desc: &ResourceDescriptor, record: &PresentRecord, body: Vec<u8>) -> Result<()> {
        let (body, encoding) = if record.kind.is_file() {
            (body, None)
        } else {
            compression::maybe_compress(body, self.config.compression_min_size)?
        };
        let mut user_metadata = durable_metadata(record);
        user_metadata.insert(fields::ETAG.to_string(), record.etag.clone());

        let write = BlobWrite {
            content_type: record.content_type.clone(),
            content_encoding: encoding.map(str::to_string),
            user_metadata,
            body,
        };
        self.durable.store(&desc.blob_path(), write).await?;
        Ok(())
    }

    /// Empty placeholder so listings see a key before its first sync.
    pub(super) async fn store_listing_stub(&self, desc: &ResourceDescriptor, record: &PresentRecord) -> Result<()> {
        let write = BlobWrite {
            content_type: record.content_type.clone(),
            content_encoding: None,
            user_metadata: durable_metadata(record),
            body: Vec::new(),
        };
        self.durable.store(&desc.blob_path(), write).await?;
        Ok(())
    }

    /// Announce a mutation. Failures are logged; the mutation already happened.
    pub(super) async fn notify(&self, desc: &ResourceDescriptor, action: ResourceAction, timestamp: i64, etag: Option<String>) {
        let event = ResourceEvent { url: desc.url(), action, timestamp, etag };
        if let Err(e) = self.topic.publish(&event).await {
            warn!(url = %event.url, action = action.as_str(), error = %e, "Failed to publish resource event");
            metrics::record_event_publish_failure();
        }
    }
}

/// User metadata stored next to every durable object.
fn durable_metadata(record: &PresentRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (fields::CREATED_AT.to_string(), record.created_at.to_string()),
        (fields::UPDATED_AT.to_string(), record.updated_at.to_string()),
        (fields::RESOURCE_TYPE.to_string(), record.kind.as_str().to_string()),
        (fields::CONTENT_LENGTH.to_string(), record.content_length.to_string()),
    ])
}

/// Recover the descriptor from a fast-tier key `{group}:{blob_path}`.
pub(crate) fn descriptor_from_key(key: &str) -> Result<ResourceDescriptor> {
    let (_, blob_path) = key
        .split_once(':')
        .ok_or_else(|| ResourceError::InvalidArgument(format!("malformed resource key '{}'", key)))?;
    ResourceDescriptor::from_blob_path(blob_path)
}

/// Metrics status label for an operation result.
pub(super) fn record_outcome<T>(operation: &str, result: &Result<T>) {
    let status = match result {
        Ok(_) => "success",
        Err(e) if e.is_conflict() => "conflict",
        Err(_) => "error",
    };
    metrics::record_operation("engine", operation, status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_key_round_trip() {
        let desc = ResourceDescriptor::from_url("conversations/bucket/a/b.json").unwrap();
        let parsed = descriptor_from_key(desc.key().as_str()).unwrap();
        assert_eq!(parsed, desc);
        assert!(descriptor_from_key("no-separator").is_err());
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent() {
        let fast = Arc::new(InMemoryFastTier::new());
        let backends = Backends { fast: fast.clone(), ..Backends::in_memory() };
        let engine = ResourceEngine::new(ResourceEngineConfig::default(), backends).await.unwrap();

        let key = ResourceDescriptor::from_url("prompts/b/p").unwrap().key();
        fast.replace_fields(
            key.as_str(),
            vec![(fields::EXISTS.to_string(), b"maybe".to_vec()), (fields::SYNCED.to_string(), b"true".to_vec())],
            None,
        )
        .await
        .unwrap();

        assert_eq!(engine.read_record(&key, false).await.unwrap(), ResourceRecord::Absent);
    }

    #[tokio::test]
    async fn test_synced_records_expire_dirty_ones_do_not() {
        let fast = Arc::new(InMemoryFastTier::new());
        let backends = Backends { fast: fast.clone(), ..Backends::in_memory() };
        let engine = ResourceEngine::new(ResourceEngineConfig::default(), backends).await.unwrap();
        let key = ResourceDescriptor::from_url("prompts/b/p").unwrap().key();

        engine.write_record(&key, &ResourceRecord::Tombstone { synced: false }).await.unwrap();
        assert_eq!(fast.expiration(key.as_str()).await.unwrap(), None);

        engine.write_record(&key, &ResourceRecord::Tombstone { synced: true }).await.unwrap();
        assert!(fast.expiration(key.as_str()).await.unwrap().is_some());
    }
}
