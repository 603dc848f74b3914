//! Engine behaviour against the in-memory backends.
//!
//! Run with: `cargo test --test engine`
//!
//! # Test Organization
//! - `read_*` / `write_*` - single-resource operations and preconditions
//! - `copy_*` / `folder_*` - multi-key and listing operations
//! - `sync_*` - write-back through the sync queue
//! - `event_*` - change notification

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use resource_engine::compression;
use resource_engine::resource::{etag, fields, parse_if_match, parse_if_none_match, ResourceRecord};
use resource_engine::storage::{BlobWrite, InMemoryDurableTier, InMemoryFastTier, InMemoryScoredSet};
use resource_engine::{
    Backends, DurableTier, EtagPrecondition, FastTier, FolderEntry, ResourceAction, ResourceDescriptor,
    ResourceEngine, ResourceEngineConfig, ResourceError, ResourceEvent, ScoredSet, SYNC_QUEUE,
};

// =============================================================================
// Helpers
// =============================================================================

struct Harness {
    engine: Arc<ResourceEngine>,
    fast: Arc<InMemoryFastTier>,
    queue: Arc<InMemoryScoredSet>,
    durable: Arc<InMemoryDurableTier>,
}

fn test_config() -> ResourceEngineConfig {
    ResourceEngineConfig {
        max_size: 64,
        sync_delay_ms: 0,
        compression_min_size: 16,
        ..Default::default()
    }
}

async fn harness_with(config: ResourceEngineConfig) -> Harness {
    let fast = Arc::new(InMemoryFastTier::new());
    let queue = Arc::new(InMemoryScoredSet::new());
    let durable = Arc::new(InMemoryDurableTier::new());
    let backends = Backends {
        fast: fast.clone(),
        queue: queue.clone(),
        durable: durable.clone(),
        ..Backends::in_memory()
    };
    let engine = Arc::new(ResourceEngine::new(config, backends).await.unwrap());
    Harness { engine, fast, queue, durable }
}

async fn harness() -> Harness {
    harness_with(test_config()).await
}

fn desc(url: &str) -> ResourceDescriptor {
    ResourceDescriptor::from_url(url).unwrap()
}

impl Harness {
    async fn fast_record(&self, desc: &ResourceDescriptor) -> ResourceRecord {
        let key = desc.key();
        let map = self.fast.get_fields(key.as_str(), fields::ALL).await.unwrap();
        ResourceRecord::decode(key.as_str(), map).unwrap()
    }

    async fn is_queued(&self, desc: &ResourceDescriptor) -> bool {
        self.queue.score(SYNC_QUEUE, desc.key().as_str()).await.unwrap().is_some()
    }

    async fn put(&self, desc: &ResourceDescriptor, body: &[u8]) -> resource_engine::ResourceMetadata {
        self.engine.put_resource(desc, body.to_vec(), &EtagPrecondition::Any).await.unwrap()
    }

    fn events(&self, descs: &[ResourceDescriptor]) -> (resource_engine::Subscription, mpsc::UnboundedReceiver<ResourceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.engine.subscribe_resources(descs, move |event| {
            tx.send(event.clone()).map_err(|e| e.to_string().into())
        });
        (sub, rx)
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ResourceEvent>) -> ResourceEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// =============================================================================
// Read / write
// =============================================================================

#[tokio::test]
async fn write_put_then_get_returns_bytes_and_content_hash() {
    let h = harness().await;
    let d = desc("conversations/bucket/chat.json");

    let meta = h.put(&d, br#"{"a":1}"#).await;
    assert_eq!(h.engine.get_max_size(), 64);
    assert_eq!(meta.etag, etag(br#"{"a":1}"#));
    assert_eq!(meta.content_type, "application/json");
    assert_eq!(meta.content_length, 7);

    let got = h.engine.get_resource_with_metadata(&d, true).await.unwrap().unwrap();
    assert_eq!(got.body.as_deref(), Some(&br#"{"a":1}"#[..]));
    assert_eq!(got.metadata.etag, meta.etag);
    assert!(h.engine.has_resource(&d).await.unwrap());
    assert_eq!(h.engine.get_etag(&d).await.unwrap(), Some(meta.etag));
}

#[tokio::test]
async fn write_same_bytes_same_etag() {
    let h = harness().await;
    let a = h.put(&desc("prompts/b/a"), b"same").await;
    let b = h.put(&desc("prompts/b/b"), b"same").await;
    assert_eq!(a.etag, b.etag);
}

#[tokio::test]
async fn write_stale_etag_conflicts_and_keeps_content() {
    let h = harness().await;
    let d = desc("prompts/bucket/p.json");

    let first = h.put(&d, br#"{"v":1}"#).await;
    let second = h
        .engine
        .put_resource(&d, br#"{"v":2}"#.to_vec(), &EtagPrecondition::if_match(first.etag.clone()))
        .await
        .unwrap();

    let err = h
        .engine
        .put_resource(&d, br#"{"v":3}"#.to_vec(), &EtagPrecondition::if_match(first.etag))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.engine.get_resource(&d).await.unwrap().unwrap(), br#"{"v":2}"#.to_vec());
    assert_eq!(h.engine.get_etag(&d).await.unwrap(), Some(second.etag));
}

#[tokio::test]
async fn write_if_match_scenario() {
    let h = harness().await;
    let d = desc("applications/bucket/app.json");
    let body = br#"{"x":"12"}"#;
    assert_eq!(body.len(), 10);

    let created = h.engine.put_resource(&d, body.to_vec(), &parse_if_match("*").unwrap()).await.unwrap();
    assert_eq!(created.etag, etag(body));

    let updated = h
        .engine
        .put_resource(&d, br#"{"x":"34"}"#.to_vec(), &EtagPrecondition::if_match(created.etag.clone()))
        .await
        .unwrap();

    let stale = h
        .engine
        .put_resource(&d, br#"{"x":"56"}"#.to_vec(), &parse_if_match(&format!("\"{}\"", created.etag)).unwrap())
        .await;
    assert!(matches!(stale, Err(ResourceError::Conflict { .. })));

    let header = format!("W/\"{}\"", updated.etag);
    let fresh = h.engine.put_resource(&d, br#"{"x":"78"}"#.to_vec(), &parse_if_match(&header).unwrap()).await.unwrap();
    assert_ne!(fresh.etag, updated.etag);
    assert_eq!(h.engine.get_resource(&d).await.unwrap().unwrap(), br#"{"x":"78"}"#.to_vec());
}

#[tokio::test]
async fn write_create_only_rejects_existing() {
    let h = harness().await;
    let d = desc("rules/bucket/r");

    h.engine.put_resource(&d, b"1".to_vec(), &EtagPrecondition::create_only()).await.unwrap();
    let again = h.engine.put_resource(&d, b"2".to_vec(), &parse_if_none_match("*").unwrap()).await;
    assert!(again.unwrap_err().is_conflict());
}

#[tokio::test]
async fn write_created_at_survives_updates() {
    let h = harness().await;
    let d = desc("prompts/b/p");
    let first = h.put(&d, b"1").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.put(&d, b"2").await;
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
}

#[tokio::test]
async fn write_folder_descriptor_is_rejected() {
    let h = harness().await;
    let folder = desc("files/bucket/dir/");
    let result = h.engine.put_resource(&folder, b"x".to_vec(), &EtagPrecondition::Any).await;
    assert!(matches!(result, Err(ResourceError::InvalidArgument(_))));
    assert!(matches!(h.engine.get_resource(&folder).await, Err(ResourceError::InvalidArgument(_))));
}

#[tokio::test]
async fn read_durable_miss_is_cached_as_tombstone() {
    let h = harness().await;
    let d = desc("prompts/bucket/missing");

    assert!(h.engine.get_resource(&d).await.unwrap().is_none());
    assert_eq!(h.fast_record(&d).await, ResourceRecord::Tombstone { synced: true });
    assert!(h.fast.expiration(d.key().as_str()).await.unwrap().is_some());

    // Visible once the cached tombstone is gone and the object exists durably
    let write = BlobWrite {
        content_type: "application/json".into(),
        content_encoding: None,
        user_metadata: BTreeMap::new(),
        body: b"{}".to_vec(),
    };
    h.durable.store(&d.blob_path(), write).await.unwrap();
    assert!(h.engine.get_resource(&d).await.unwrap().is_none());

    h.fast.remove(d.key().as_str()).await.unwrap();
    let got = h.engine.get_resource_with_metadata(&d, true).await.unwrap().unwrap();
    assert_eq!(got.body, Some(b"{}".to_vec()));
    assert_eq!(got.metadata.etag, etag(b"{}"));
}

#[tokio::test]
async fn read_reloads_from_durable_after_eviction() {
    let h = harness().await;
    let d = desc("conversations/bucket/chat.json");
    let body = br#"{"messages":["hello","world"]}"#;
    let meta = h.put(&d, body).await;
    h.engine.sync_once().await.unwrap();

    h.fast.clear();
    let got = h.engine.get_resource_with_metadata(&d, true).await.unwrap().unwrap();
    assert_eq!(got.body.as_deref(), Some(&body[..]));
    assert_eq!(got.metadata.etag, meta.etag);
    assert_eq!(got.metadata.created_at, meta.created_at);

    let ResourceRecord::Present(cached) = h.fast_record(&d).await else { panic!("expected cached record") };
    assert!(cached.synced);
}

#[tokio::test]
async fn read_held_requires_matching_guard() {
    let h = harness().await;
    let d = desc("limits/bucket/user");
    h.put(&d, b"7").await;

    let guard = h.engine.lock_resource(&d).await.unwrap();
    let got = h.engine.get_resource_with_metadata_held(&d, true, &guard).await.unwrap().unwrap();
    assert_eq!(got.body.unwrap(), b"7".to_vec());

    let other = desc("limits/bucket/other");
    let wrong = h.engine.get_resource_with_metadata_held(&other, false, &guard).await;
    assert!(matches!(wrong, Err(ResourceError::InvalidArgument(_))));
}

// =============================================================================
// Compute
// =============================================================================

#[tokio::test]
async fn write_compute_identity_is_noop_without_event() {
    let h = harness().await;
    let d = desc("publications/bucket/pub");
    let original = h.put(&d, b"{}").await;
    let (_sub, mut rx) = h.events(std::slice::from_ref(&d));

    let result = h
        .engine
        .compute_resource(&d, &EtagPrecondition::Any, |old| Ok(old.map(<[u8]>::to_vec)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, original);

    // The next event is the following put, not the compute
    let next = h.put(&d, b"{\"n\":1}").await;
    let event = next_event(&mut rx).await;
    assert_eq!(event.action, ResourceAction::Update);
    assert_eq!(event.etag, Some(next.etag));
}

#[tokio::test]
async fn write_compute_none_on_missing_is_noop() {
    let h = harness().await;
    let d = desc("invitations/bucket/inv");

    let result = h.engine.compute_resource(&d, &EtagPrecondition::Any, |old| {
        assert!(old.is_none());
        Ok(None)
    });
    assert_eq!(result.await.unwrap(), None);
    assert!(!h.engine.has_resource(&d).await.unwrap());
    assert!(!h.is_queued(&d).await);
    assert!(!h.durable.exists(&d.blob_path()).await.unwrap());
}

#[tokio::test]
async fn write_compute_none_deletes_existing() {
    let h = harness().await;
    let d = desc("notifications/bucket/n");
    h.put(&d, b"[1]").await;

    let result = h.engine.compute_resource(&d, &EtagPrecondition::Any, |_| Ok(None)).await.unwrap();
    assert_eq!(result, None);
    assert!(h.engine.get_resource(&d).await.unwrap().is_none());
    assert!(!h.durable.exists(&d.blob_path()).await.unwrap());
}

#[tokio::test]
async fn write_compute_transform_error_changes_nothing() {
    let h = harness().await;
    let d = desc("rules/bucket/r");
    h.put(&d, b"1").await;

    let result = h.engine.compute_resource(&d, &EtagPrecondition::Any, |_| Err("bad input".into())).await;
    assert!(matches!(result, Err(ResourceError::Transform(_))));
    assert_eq!(h.engine.get_resource(&d).await.unwrap().unwrap(), b"1".to_vec());
}

#[tokio::test]
async fn write_concurrent_compute_is_serialized() {
    let h = harness().await;
    let d = desc("limits/bucket/counter");
    const CALLERS: usize = 32;

    let tasks = (0..CALLERS).map(|_| {
        let engine = h.engine.clone();
        let d = d.clone();
        tokio::spawn(async move {
            engine
                .compute_resource(&d, &EtagPrecondition::Any, |old| {
                    let current = old
                        .map(|b| std::str::from_utf8(b).unwrap().parse::<usize>().unwrap())
                        .unwrap_or(0);
                    Ok(Some((current + 1).to_string().into_bytes()))
                })
                .await
                .unwrap();
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    let body = h.engine.get_resource(&d).await.unwrap().unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), CALLERS.to_string());
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn write_delete_is_synchronous_end_to_end() {
    let h = harness().await;
    let d = desc("conversations/bucket/gone.json");
    h.put(&d, b"{}").await;
    assert!(h.is_queued(&d).await);

    assert!(h.engine.delete_resource(&d, &EtagPrecondition::Any).await.unwrap());
    assert!(h.engine.get_resource(&d).await.unwrap().is_none());
    assert!(!h.durable.exists(&d.blob_path()).await.unwrap());
    assert!(!h.is_queued(&d).await);
    assert_eq!(h.fast_record(&d).await, ResourceRecord::Tombstone { synced: true });

    assert!(!h.engine.delete_resource(&d, &EtagPrecondition::Any).await.unwrap());
}

#[tokio::test]
async fn write_delete_with_stale_etag_conflicts() {
    let h = harness().await;
    let d = desc("prompts/bucket/p");
    h.put(&d, b"1").await;

    let result = h.engine.delete_resource(&d, &EtagPrecondition::if_match("stale")).await;
    assert!(result.unwrap_err().is_conflict());
    assert!(h.engine.has_resource(&d).await.unwrap());
}

// =============================================================================
// Oversized bodies and streaming
// =============================================================================

#[tokio::test]
async fn write_oversized_body_only_stub_in_fast_tier() {
    let h = harness().await;
    let d = desc("files/bucket/big.bin");
    let body: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();

    let meta = h.put(&d, &body).await;
    assert_eq!(meta.content_length, 200);
    assert!(!h.is_queued(&d).await);

    let ResourceRecord::Present(stub) = h.fast_record(&d).await else { panic!("expected stub") };
    assert_eq!(stub.body, Some(Vec::new()));
    assert_eq!(stub.content_length, 200);
    assert!(stub.synced);

    let stream = h.engine.get_resource_stream(&d).await.unwrap().unwrap();
    assert_eq!(stream.metadata.etag, etag(&body));
    let streamed: Vec<u8> = stream.body.concat().await;
    assert_eq!(streamed, body);

    // Reading the body does not cache it
    let ResourceRecord::Present(after) = h.fast_record(&d).await else { panic!("expected stub") };
    assert_eq!(after.body, Some(Vec::new()));
}

#[tokio::test]
async fn write_oversized_after_small_flushes_dirty_version() {
    let h = harness().await;
    let d = desc("prompts/bucket/grows");
    h.put(&d, b"{}").await;
    assert!(h.is_queued(&d).await);

    let big = vec![b'x'; 100];
    let meta = h.put(&d, &big).await;
    assert!(!h.is_queued(&d).await);
    assert_eq!(h.engine.get_resource(&d).await.unwrap().unwrap(), big);

    // Non-file bodies above the threshold are stored compressed
    let blob = h.durable.load(&d.blob_path()).await.unwrap().unwrap();
    assert_eq!(blob.meta.content_encoding.as_deref(), Some(compression::GZIP_ENCODING));
    assert_eq!(blob.meta.user_metadata.get("etag"), Some(&meta.etag));
}

#[tokio::test]
async fn read_stream_of_small_resource() {
    let h = harness().await;
    let d = desc("files/bucket/small.txt");
    h.put(&d, b"hello").await;

    let stream = h.engine.get_resource_stream(&d).await.unwrap().unwrap();
    assert_eq!(stream.body.concat().await, b"hello".to_vec());
    assert!(h.engine.get_resource_stream(&desc("files/bucket/none")).await.unwrap().is_none());
}

#[tokio::test]
async fn write_put_file_keeps_content_type_uncompressed() {
    let h = harness().await;
    let d = desc("files/bucket/doc.txt");
    let chunks = stream::iter(vec![b"hello ".to_vec(), b"world, this is a file".to_vec()]);

    let meta = h.engine.put_file(&d, "text/plain", chunks, &EtagPrecondition::Any).await.unwrap();
    assert_eq!(meta.content_type, "text/plain");
    assert_eq!(meta.etag, etag(b"hello world, this is a file"));

    h.engine.sync_once().await.unwrap();
    let blob = h.durable.load(&d.blob_path()).await.unwrap().unwrap();
    assert_eq!(blob.meta.content_encoding, None);
    assert_eq!(blob.meta.content_type.as_deref(), Some("text/plain"));
    assert_eq!(blob.body, b"hello world, this is a file".to_vec());

    let not_file = h
        .engine
        .put_file(&desc("prompts/bucket/p"), "text/plain", stream::iter(vec![b"x".to_vec()]), &EtagPrecondition::Any)
        .await;
    assert!(matches!(not_file, Err(ResourceError::InvalidArgument(_))));
}

#[tokio::test]
async fn write_gzip_file_round_trips_after_sync_and_evict() {
    let h = harness().await;
    let d = desc("files/bucket/small.gz");
    let packed = compression::compress(b"hi").unwrap();
    assert!(packed.len() <= 64);

    let chunks = stream::iter(vec![packed.clone()]);
    let meta = h.engine.put_file(&d, "application/gzip", chunks, &EtagPrecondition::Any).await.unwrap();
    assert_eq!(meta.etag, etag(&packed));

    h.engine.sync_once().await.unwrap();
    h.engine.flush(&d).await.unwrap();
    assert_eq!(h.fast_record(&d).await, ResourceRecord::Absent);

    let got = h.engine.get_resource_with_metadata(&d, true).await.unwrap().unwrap();
    assert_eq!(got.body, Some(packed.clone()));
    assert_eq!(got.metadata.etag, etag(&packed));
    assert_eq!(got.metadata.content_length, packed.len() as u64);
}

#[tokio::test]
async fn write_oversized_gzip_file_streams_stored_bytes() {
    let h = harness().await;
    let d = desc("files/bucket/archive.gz");
    let raw: Vec<u8> = (0..8000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
    let packed = compression::compress(&raw).unwrap();
    assert!(packed.len() > 64);

    let chunks = stream::iter(packed.chunks(500).map(<[u8]>::to_vec).collect::<Vec<_>>());
    let meta = h.engine.put_file(&d, "application/gzip", chunks, &EtagPrecondition::Any).await.unwrap();
    assert_eq!(meta.content_length, packed.len() as u64);

    let stream = h.engine.get_resource_stream(&d).await.unwrap().unwrap();
    assert_eq!(stream.metadata.etag, etag(&packed));
    assert_eq!(stream.body.concat().await, packed);
}

// =============================================================================
// Copy
// =============================================================================

#[tokio::test]
async fn copy_without_overwrite_keeps_destination() {
    let h = harness().await;
    let a = desc("conversations/bucket/a.json");
    let b = desc("conversations/bucket/b.json");
    h.put(&a, b"\"a\"").await;
    let b_meta = h.put(&b, b"\"b\"").await;

    assert!(!h.engine.copy_resource(&a, &b, false).await.unwrap());
    assert_eq!(h.engine.get_resource(&b).await.unwrap().unwrap(), b"\"b\"".to_vec());
    assert_eq!(h.engine.get_etag(&b).await.unwrap(), Some(b_meta.etag));

    assert!(h.engine.copy_resource(&a, &b, true).await.unwrap());
    assert_eq!(h.engine.get_resource(&b).await.unwrap().unwrap(), b"\"a\"".to_vec());
    assert_eq!(h.engine.get_resource(&a).await.unwrap().unwrap(), b"\"a\"".to_vec());
}

#[tokio::test]
async fn copy_to_new_destination_publishes_create() {
    let h = harness().await;
    let a = desc("prompts/bucket/a");
    let b = desc("prompts/bucket/b");
    let a_meta = h.put(&a, b"{\"k\":1}").await;
    let (_sub, mut rx) = h.events(std::slice::from_ref(&b));

    assert!(h.engine.copy_resource(&a, &b, false).await.unwrap());
    let event = next_event(&mut rx).await;
    assert_eq!(event.action, ResourceAction::Create);
    assert_eq!(event.etag, Some(a_meta.etag.clone()));
    assert_eq!(h.engine.get_etag(&b).await.unwrap(), Some(a_meta.etag));
}

#[tokio::test]
async fn copy_errors() {
    let h = harness().await;
    let a = desc("prompts/bucket/a");
    let missing = desc("prompts/bucket/missing");

    assert!(matches!(h.engine.copy_resource(&a, &a, true).await, Err(ResourceError::InvalidArgument(_))));
    assert!(matches!(h.engine.copy_resource(&missing, &a, true).await, Err(ResourceError::NotFound(_))));
}

#[tokio::test]
async fn copy_reciprocal_copies_do_not_deadlock() {
    let h = harness().await;
    let a = desc("conversations/bucket/a");
    let b = desc("conversations/bucket/b");
    h.put(&a, b"1").await;
    h.put(&b, b"2").await;

    let tasks = (0..20).map(|i| {
        let engine = h.engine.clone();
        let (from, to) = if i % 2 == 0 { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        tokio::spawn(async move { engine.copy_resource(&from, &to, true).await.unwrap() })
    });
    let results = tokio::time::timeout(Duration::from_secs(10), join_all(tasks)).await.unwrap();
    assert!(results.into_iter().all(|r| r.unwrap()));
}

// =============================================================================
// Folders
// =============================================================================

#[tokio::test]
async fn folder_listing_classifies_entries() {
    let h = harness().await;
    h.put(&desc("files/bucket/docs/a.txt"), b"a").await;
    h.put(&desc("files/bucket/docs/sub/b.txt"), b"b").await;
    h.put(&desc("files/bucket/other.txt"), b"o").await;

    let folder = desc("files/bucket/docs/");
    let page = h.engine.get_folder_metadata(&folder, None, 100, false).await.unwrap().unwrap();
    let urls: Vec<String> = page.entries.iter().map(|e| e.descriptor().url()).collect();
    assert_eq!(urls, vec!["files/bucket/docs/a.txt", "files/bucket/docs/sub/"]);
    assert!(!page.entries[0].is_folder());
    assert!(page.entries[1].is_folder());
    assert_eq!(page.next_token, None);

    let recursive = h.engine.get_folder_metadata(&folder, None, 100, true).await.unwrap().unwrap();
    assert_eq!(recursive.entries.len(), 2);
    assert!(recursive.entries.iter().all(|e| matches!(e, FolderEntry::Item(_))));

    assert!(h.engine.get_folder_metadata(&desc("files/bucket/empty/"), None, 100, false).await.unwrap().is_none());
    let root = h.engine.get_folder_metadata(&desc("prompts/bucket/"), None, 100, false).await.unwrap().unwrap();
    assert!(root.entries.is_empty());
}

#[tokio::test]
async fn folder_listing_paginates() {
    let h = harness().await;
    for i in 0..5 {
        h.put(&desc(&format!("prompts/bucket/p{}", i)), b"{}").await;
    }
    let root = desc("prompts/bucket/");

    let mut seen = Vec::new();
    let mut token = None;
    loop {
        let page = h.engine.get_folder_metadata(&root, token.as_deref(), 2, false).await.unwrap().unwrap();
        assert!(page.entries.len() <= 2);
        seen.extend(page.entries.iter().map(|e| e.descriptor().name().to_string()));
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, vec!["p0", "p1", "p2", "p3", "p4"]);
}

#[tokio::test]
async fn folder_unsynced_item_listed_from_stub() {
    let h = harness().await;
    let d = desc("conversations/bucket/new.json");
    let meta = h.put(&d, b"{\"fresh\":true}").await;

    let page = h.engine.get_folder_metadata(&desc("conversations/bucket/"), None, 10, false).await.unwrap().unwrap();
    let [FolderEntry::Item(item)] = page.entries.as_slice() else { panic!("expected one item") };
    assert_eq!(item.descriptor, d);
    assert_eq!(item.etag, None);
    assert_eq!(item.created_at, Some(meta.created_at));

    h.engine.sync_once().await.unwrap();
    let page = h.engine.get_folder_metadata(&desc("conversations/bucket/"), None, 10, false).await.unwrap().unwrap();
    let [FolderEntry::Item(item)] = page.entries.as_slice() else { panic!("expected one item") };
    assert_eq!(item.etag, Some(meta.etag));
}

#[tokio::test]
async fn folder_copy_and_delete() {
    let h = harness().await;
    h.put(&desc("files/bucket/src/a.txt"), b"a").await;
    h.put(&desc("files/bucket/src/deep/b.txt"), b"b").await;

    let copied = h.engine.copy_folder(&desc("files/bucket/src/"), &desc("files/bucket/dst/"), false).await.unwrap();
    assert_eq!(copied, 2);
    assert_eq!(h.engine.get_resource(&desc("files/bucket/dst/deep/b.txt")).await.unwrap().unwrap(), b"b".to_vec());

    let nested = h.engine.copy_folder(&desc("files/bucket/src/"), &desc("files/bucket/src/deep/"), true).await;
    assert!(matches!(nested, Err(ResourceError::InvalidArgument(_))));

    let deleted = h.engine.delete_folder(&desc("files/bucket/src/")).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(h.engine.get_resource(&desc("files/bucket/src/a.txt")).await.unwrap().is_none());
    assert!(h.engine.get_folder_metadata(&desc("files/bucket/src/"), None, 10, true).await.unwrap().is_none());
    assert!(h.engine.has_resource(&desc("files/bucket/dst/a.txt")).await.unwrap());
}

// =============================================================================
// Sync
// =============================================================================

#[tokio::test]
async fn sync_writes_back_and_marks_synced() {
    let h = harness().await;
    let d = desc("conversations/bucket/chat.json");
    let body = br#"{"messages":["a long enough body to compress"]}"#;
    let meta = h.put(&d, body).await;

    // Listing stub only until the worker runs
    let stub = h.durable.load(&d.blob_path()).await.unwrap().unwrap();
    assert!(stub.body.is_empty());
    assert!(!stub.meta.user_metadata.contains_key("etag"));
    assert_eq!(h.fast.expiration(d.key().as_str()).await.unwrap(), None);

    let report = h.engine.sync_once().await.unwrap();
    assert_eq!((report.due, report.synced, report.failed), (1, 1, 0));
    assert!(!h.is_queued(&d).await);

    let blob = h.durable.load(&d.blob_path()).await.unwrap().unwrap();
    assert_eq!(blob.meta.content_encoding.as_deref(), Some(compression::GZIP_ENCODING));
    assert_eq!(compression::decompress(&blob.body).unwrap(), body.to_vec());
    assert_eq!(blob.meta.user_metadata.get("etag"), Some(&meta.etag));

    let ResourceRecord::Present(record) = h.fast_record(&d).await else { panic!("expected record") };
    assert!(record.synced);
    assert_eq!(record.body.as_deref(), Some(&body[..]));
    assert_eq!(record.etag, meta.etag);
    assert!(h.fast.expiration(d.key().as_str()).await.unwrap().is_some());

    assert_eq!(h.engine.sync_once().await.unwrap().due, 0);
}

#[tokio::test]
async fn sync_skips_locked_keys() {
    let h = harness().await;
    let d = desc("prompts/bucket/busy");
    h.put(&d, b"{}").await;

    let guard = h.engine.lock_resource(&d).await.unwrap();
    let report = h.engine.sync_once().await.unwrap();
    assert_eq!((report.skipped, report.synced), (1, 0));
    assert!(h.is_queued(&d).await);

    drop(guard);
    assert_eq!(h.engine.sync_once().await.unwrap().synced, 1);
}

#[tokio::test]
async fn sync_respects_delay() {
    let h = harness_with(ResourceEngineConfig { sync_delay_ms: 60_000, ..test_config() }).await;
    let d = desc("prompts/bucket/later");
    h.put(&d, b"{}").await;

    assert_eq!(h.engine.sync_once().await.unwrap().due, 0);
    assert!(h.is_queued(&d).await);
}

#[tokio::test]
async fn sync_shutdown_flushes_everything_queued() {
    let h = harness_with(ResourceEngineConfig { sync_delay_ms: 60_000, ..test_config() }).await;
    let d = desc("prompts/bucket/pending");
    let meta = h.put(&d, b"{\"pending\":1}").await;

    let report = h.engine.shutdown().await.unwrap();
    assert_eq!(report.synced, 1);
    let blob = h.durable.meta(&d.blob_path()).await.unwrap().unwrap();
    assert_eq!(blob.user_metadata.get("etag"), Some(&meta.etag));
}

#[tokio::test]
async fn sync_shutdown_drains_more_keys_than_one_batch() {
    let h = harness_with(ResourceEngineConfig { sync_batch: 2, ..test_config() }).await;
    let descs: Vec<_> = (0..5).map(|i| desc(&format!("prompts/bucket/p{}", i))).collect();
    for d in &descs {
        h.put(d, b"{}").await;
    }

    let report = h.engine.shutdown().await.unwrap();
    assert_eq!(report.synced, 5);
    assert_eq!(report.due, 5);
    assert_eq!(report.failed, 0);
    for d in &descs {
        assert!(!h.is_queued(d).await);
        assert!(h.durable.meta(&d.blob_path()).await.unwrap().is_some());
    }
}

#[tokio::test]
async fn sync_worker_drains_queue_periodically() {
    let h = harness_with(ResourceEngineConfig { sync_period_ms: 20, ..test_config() }).await;
    let worker = h.engine.start_sync_worker();
    assert!(worker.is_running());

    let d = desc("prompts/bucket/auto");
    h.put(&d, b"{}").await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.is_queued(&d).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never synced the key");

    // A second start returns the running worker
    let again = h.engine.start_sync_worker();
    assert!(again.is_running());

    worker.stop().await;
    assert!(!worker.is_running());
    assert!(!again.is_running());
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn event_subscription_scenario() {
    let h = harness().await;
    let x = desc("shared_with_me/bucket/x");
    h.put(&x, b"{}").await;

    let (sub, mut rx) = h.events(std::slice::from_ref(&x));
    let updated = h.put(&x, b"{\"v\":2}").await;

    let event = next_event(&mut rx).await;
    assert_eq!(event.url, x.url());
    assert_eq!(event.action, ResourceAction::Update);
    assert_eq!(event.etag, Some(updated.etag));

    sub.close();
    sub.close();
    h.put(&x, b"{\"v\":3}").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn event_actions_for_create_and_delete() {
    let h = harness().await;
    let d = desc("shared_by_me/bucket/s");
    let (_sub, mut rx) = h.events(std::slice::from_ref(&d));

    let created = h.put(&d, b"[]").await;
    let event = next_event(&mut rx).await;
    assert_eq!((event.action, event.etag), (ResourceAction::Create, Some(created.etag)));

    h.engine.delete_resource(&d, &EtagPrecondition::Any).await.unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!((event.action, event.etag), (ResourceAction::Delete, None));
}

#[tokio::test]
async fn event_failing_subscriber_does_not_block_others() {
    let h = harness().await;
    let d = desc("prompts/bucket/p");
    let _bad = h.engine.subscribe_resources(std::slice::from_ref(&d), |_| Err("subscriber failed".into()));
    let (_good, mut rx) = h.events(std::slice::from_ref(&d));

    h.put(&d, b"{}").await;
    assert_eq!(next_event(&mut rx).await.action, ResourceAction::Create);
}
