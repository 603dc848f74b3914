//! Failure injection for the resource engine.
//!
//! Backends are wrapped so individual calls can be made to fail:
//! 1. **FlakyDurableTier** - fail every call, or only calls touching chosen paths
//! 2. **FlakyFastTier** - fail every call while switched on
//! 3. **FailingEventBus** - publish always fails
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use resource_engine::resource::{fields, ResourceRecord};
use resource_engine::storage::{
    Blob, BlobMetadata, BlobPage, BlobWrite, FieldMap, InMemoryDurableTier, InMemoryFastTier, InMemoryScoredSet,
};
use resource_engine::{
    Backends, DurableTier, EtagPrecondition, EventBus, FastTier, ResourceDescriptor, ResourceEngine,
    ResourceEngineConfig, ResourceError, ScoredSet, StorageError, TopicError, SYNC_QUEUE,
};

// =============================================================================
// Failing Backend Wrappers
// =============================================================================

/// Durable tier that fails on demand.
struct FlakyDurableTier {
    inner: InMemoryDurableTier,
    fail_all: AtomicBool,
    fail_paths: Mutex<HashSet<String>>,
    failures: AtomicU64,
}

impl FlakyDurableTier {
    fn new() -> Self {
        Self {
            inner: InMemoryDurableTier::new(),
            fail_all: AtomicBool::new(false),
            fail_paths: Mutex::new(HashSet::new()),
            failures: AtomicU64::new(0),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    fn fail_path(&self, path: &str) {
        self.fail_paths.lock().insert(path.to_string());
    }

    fn heal(&self) {
        self.set_failing(false);
        self.fail_paths.lock().clear();
    }

    fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, path: &str) -> Result<(), StorageError> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_paths.lock().contains(path) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend(format!("injected failure on '{}'", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableTier for FlakyDurableTier {
    async fn load(&self, path: &str) -> Result<Option<Blob>, StorageError> {
        self.maybe_fail(path)?;
        self.inner.load(path).await
    }

    async fn store(&self, path: &str, write: BlobWrite) -> Result<(), StorageError> {
        self.maybe_fail(path)?;
        self.inner.store(path, write).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.maybe_fail(path)?;
        self.inner.delete(path).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.maybe_fail(from)?;
        self.maybe_fail(to)?;
        self.inner.copy(from, to).await
    }

    async fn meta(&self, path: &str) -> Result<Option<BlobMetadata>, StorageError> {
        self.maybe_fail(path)?;
        self.inner.meta(path).await
    }

    async fn list(
        &self,
        prefix: &str,
        token: Option<&str>,
        limit: usize,
        recursive: bool,
    ) -> Result<BlobPage, StorageError> {
        self.maybe_fail(prefix)?;
        self.inner.list(prefix, token, limit, recursive).await
    }
}

/// Fast tier that fails every call while switched on.
struct FlakyFastTier {
    inner: InMemoryFastTier,
    failing: AtomicBool,
}

impl FlakyFastTier {
    fn new() -> Self {
        Self { inner: InMemoryFastTier::new(), failing: AtomicBool::new(false) }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Backend("fast tier unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FastTier for FlakyFastTier {
    async fn get_fields(&self, key: &str, fields: &[&str]) -> Result<FieldMap, StorageError> {
        self.maybe_fail()?;
        self.inner.get_fields(key, fields).await
    }

    async fn replace_fields(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        expiration: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.replace_fields(key, fields, expiration).await
    }

    async fn update_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.update_fields(key, fields).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.set_expiration(key, ttl).await
    }

    async fn clear_expiration(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.clear_expiration(key).await
    }

    async fn expiration(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.maybe_fail()?;
        self.inner.expiration(key).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.remove(key).await
    }
}

/// Bus whose publishes always fail. Listening yields nothing.
struct FailingEventBus {
    attempts: AtomicU64,
}

#[async_trait]
impl EventBus for FailingEventBus {
    async fn publish(&self, _payload: Vec<u8>) -> Result<(), TopicError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TopicError::Backend("bus unavailable".to_string()))
    }

    async fn listen(&self) -> Result<BoxStream<'static, Vec<u8>>, TopicError> {
        Ok(stream::pending().boxed())
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Chaos {
    engine: Arc<ResourceEngine>,
    fast: Arc<FlakyFastTier>,
    queue: Arc<InMemoryScoredSet>,
    durable: Arc<FlakyDurableTier>,
}

fn chaos_config() -> ResourceEngineConfig {
    ResourceEngineConfig { max_size: 64, sync_delay_ms: 0, sync_period_ms: 10, ..Default::default() }
}

async fn chaos_engine() -> Chaos {
    let fast = Arc::new(FlakyFastTier::new());
    let queue = Arc::new(InMemoryScoredSet::new());
    let durable = Arc::new(FlakyDurableTier::new());
    let backends = Backends {
        fast: fast.clone(),
        queue: queue.clone(),
        durable: durable.clone(),
        ..Backends::in_memory()
    };
    let engine = Arc::new(ResourceEngine::new(chaos_config(), backends).await.unwrap());
    Chaos { engine, fast, queue, durable }
}

fn desc(url: &str) -> ResourceDescriptor {
    ResourceDescriptor::from_url(url).unwrap()
}

impl Chaos {
    async fn is_queued(&self, desc: &ResourceDescriptor) -> bool {
        self.queue.score(SYNC_QUEUE, desc.key().as_str()).await.unwrap().is_some()
    }

    async fn fast_record(&self, desc: &ResourceDescriptor) -> ResourceRecord {
        let key = desc.key();
        let map = self.fast.inner.get_fields(key.as_str(), fields::ALL).await.unwrap();
        ResourceRecord::decode(key.as_str(), map).unwrap()
    }
}

// =============================================================================
// Sync Worker Failures
// =============================================================================

#[tokio::test]
async fn test_failed_write_back_keeps_key_queued() {
    let c = chaos_engine().await;
    let d = desc("conversations/b/chat.json");
    c.engine.put_resource(&d, b"{\"v\":1}".to_vec(), &EtagPrecondition::Any).await.unwrap();

    c.durable.set_failing(true);
    let report = c.engine.sync_once().await.unwrap();
    assert_eq!((report.synced, report.failed), (0, 1));
    assert!(c.is_queued(&d).await);

    let ResourceRecord::Present(record) = c.fast_record(&d).await else { panic!("record lost") };
    assert!(!record.synced);
    // Dirty data is still served from the fast tier
    assert_eq!(c.engine.get_resource(&d).await.unwrap().unwrap(), b"{\"v\":1}".to_vec());

    c.durable.heal();
    let report = c.engine.sync_once().await.unwrap();
    assert_eq!(report.synced, 1);
    assert!(!c.is_queued(&d).await);
}

#[tokio::test]
async fn test_failing_key_does_not_block_batch() {
    let c = chaos_engine().await;
    let good = desc("prompts/b/good");
    let bad = desc("prompts/b/bad");
    c.engine.put_resource(&good, b"1".to_vec(), &EtagPrecondition::Any).await.unwrap();
    c.engine.put_resource(&bad, b"2".to_vec(), &EtagPrecondition::Any).await.unwrap();

    c.durable.fail_path(&bad.blob_path());
    let report = c.engine.sync_once().await.unwrap();
    assert_eq!((report.due, report.synced, report.failed), (2, 1, 1));
    assert!(!c.is_queued(&good).await);
    assert!(c.is_queued(&bad).await);
}

#[tokio::test]
async fn test_worker_survives_failing_ticks() {
    let c = chaos_engine().await;
    let d = desc("rules/b/r");
    c.engine.put_resource(&d, b"{}".to_vec(), &EtagPrecondition::Any).await.unwrap();

    c.durable.set_failing(true);
    let worker = c.engine.start_sync_worker();
    tokio::time::timeout(Duration::from_secs(5), async {
        while c.durable.failure_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker stopped retrying");
    assert!(worker.is_running());
    assert!(c.is_queued(&d).await);

    c.durable.heal();
    tokio::time::timeout(Duration::from_secs(5), async {
        while c.is_queued(&d).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker never recovered");
    worker.stop().await;
}

#[tokio::test]
async fn test_shutdown_reports_failed_keys() {
    let c = chaos_engine().await;
    let d = desc("prompts/b/p");
    c.engine.put_resource(&d, b"{}".to_vec(), &EtagPrecondition::Any).await.unwrap();

    c.durable.set_failing(true);
    let report = c.engine.shutdown().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(c.is_queued(&d).await);
}

// =============================================================================
// Foreground Failures
// =============================================================================

#[tokio::test]
async fn test_first_put_fails_cleanly_when_durable_down() {
    let c = chaos_engine().await;
    let d = desc("conversations/b/new.json");

    c.durable.set_failing(true);
    let result = c.engine.put_resource(&d, b"{}".to_vec(), &EtagPrecondition::Any).await;
    assert!(matches!(result, Err(ResourceError::Storage(_))));
    assert_eq!(c.fast_record(&d).await, ResourceRecord::Absent);
    assert!(!c.is_queued(&d).await);
}

#[tokio::test]
async fn test_oversized_put_fails_cleanly_when_durable_down() {
    let c = chaos_engine().await;
    let d = desc("files/b/big.bin");

    c.durable.set_failing(true);
    let result = c.engine.put_resource(&d, vec![7u8; 500], &EtagPrecondition::Any).await;
    assert!(result.is_err());
    assert_eq!(c.fast_record(&d).await, ResourceRecord::Absent);

    c.durable.heal();
    assert!(c.engine.get_resource(&d).await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_delete_finished_by_worker() {
    let c = chaos_engine().await;
    let d = desc("notifications/b/n");
    c.engine.put_resource(&d, b"[]".to_vec(), &EtagPrecondition::Any).await.unwrap();
    c.engine.sync_once().await.unwrap();

    c.durable.set_failing(true);
    let result = c.engine.delete_resource(&d, &EtagPrecondition::Any).await;
    assert!(matches!(result, Err(ResourceError::Storage(_))));

    // The tombstone already hides the resource
    assert_eq!(c.fast_record(&d).await, ResourceRecord::Tombstone { synced: false });
    assert!(c.engine.get_resource(&d).await.unwrap().is_none());
    assert!(c.is_queued(&d).await);

    c.durable.heal();
    assert!(c.durable.inner.exists(&d.blob_path()).await.unwrap());
    assert_eq!(c.engine.sync_once().await.unwrap().synced, 1);
    assert!(!c.durable.inner.exists(&d.blob_path()).await.unwrap());
    assert_eq!(c.fast_record(&d).await, ResourceRecord::Tombstone { synced: true });
}

#[tokio::test]
async fn test_fast_tier_outage_surfaces_errors() {
    let c = chaos_engine().await;
    let d = desc("prompts/b/p");
    c.engine.put_resource(&d, b"{}".to_vec(), &EtagPrecondition::Any).await.unwrap();

    c.fast.set_failing(true);
    assert!(matches!(c.engine.get_resource(&d).await, Err(ResourceError::Storage(_))));
    assert!(c.engine.put_resource(&d, b"[]".to_vec(), &EtagPrecondition::Any).await.is_err());

    c.fast.set_failing(false);
    assert_eq!(c.engine.get_resource(&d).await.unwrap().unwrap(), b"{}".to_vec());
}

#[tokio::test]
async fn test_listing_error_propagates() {
    let c = chaos_engine().await;
    c.durable.set_failing(true);
    let result = c.engine.get_folder_metadata(&desc("files/b/dir/"), None, 10, false).await;
    assert!(matches!(result, Err(ResourceError::Storage(_))));
}

// =============================================================================
// Data Corruption
// =============================================================================

#[tokio::test]
async fn test_corrupt_fast_record_falls_back_to_durable() {
    let c = chaos_engine().await;
    let d = desc("prompts/b/p");
    let meta = c.engine.put_resource(&d, b"{\"ok\":true}".to_vec(), &EtagPrecondition::Any).await.unwrap();
    c.engine.sync_once().await.unwrap();

    let garbage = vec![
        (fields::EXISTS.to_string(), b"true".to_vec()),
        (fields::SYNCED.to_string(), b"true".to_vec()),
        (fields::CONTENT_LENGTH.to_string(), b"not-a-number".to_vec()),
    ];
    c.fast.inner.replace_fields(d.key().as_str(), garbage, None).await.unwrap();

    let got = c.engine.get_resource_with_metadata(&d, true).await.unwrap().unwrap();
    assert_eq!(got.body.unwrap(), b"{\"ok\":true}".to_vec());
    assert_eq!(got.metadata.etag, meta.etag);
    // The durable copy replaced the corrupt record
    assert!(matches!(c.fast_record(&d).await, ResourceRecord::Present(_)));
}

#[tokio::test]
async fn test_dirty_record_without_body_is_evicted() {
    let c = chaos_engine().await;
    let d = desc("prompts/b/p");
    c.engine.put_resource(&d, b"{}".to_vec(), &EtagPrecondition::Any).await.unwrap();

    // Drop the body field, keeping the dirty metadata
    let key = d.key();
    let mut fields_left = c.fast.inner.get_fields(key.as_str(), fields::METADATA).await.unwrap();
    fields_left.remove(fields::BODY);
    c.fast.inner.replace_fields(key.as_str(), fields_left.into_iter().collect(), None).await.unwrap();

    let report = c.engine.sync_once().await.unwrap();
    assert_eq!((report.synced, report.normalized), (0, 1));
    assert!(!c.is_queued(&d).await);
    assert_eq!(c.fast_record(&d).await, ResourceRecord::Absent);
}

#[tokio::test]
async fn test_orphaned_queue_entry_is_dropped() {
    let c = chaos_engine().await;
    c.queue.add(SYNC_QUEUE, "not a resource key", 0).await.unwrap();
    c.queue.add(SYNC_QUEUE, &desc("prompts/b/gone").key().to_string(), 0).await.unwrap();

    let report = c.engine.sync_once().await.unwrap();
    assert_eq!(report.normalized, 2);
    assert_eq!(c.queue.len(SYNC_QUEUE).await.unwrap(), 0);
}

// =============================================================================
// Event Bus Failures
// =============================================================================

#[tokio::test]
async fn test_publish_failure_does_not_fail_mutations() {
    let bus = Arc::new(FailingEventBus { attempts: AtomicU64::new(0) });
    let backends = Backends { bus: bus.clone(), ..Backends::in_memory() };
    let engine = ResourceEngine::new(chaos_config(), backends).await.unwrap();
    let d = desc("shared_with_me/b/x");

    engine.put_resource(&d, b"{}".to_vec(), &EtagPrecondition::Any).await.unwrap();
    engine.put_resource(&d, b"[]".to_vec(), &EtagPrecondition::Any).await.unwrap();
    assert!(engine.delete_resource(&d, &EtagPrecondition::Any).await.unwrap());
    assert_eq!(bus.attempts.load(Ordering::SeqCst), 3);
}
