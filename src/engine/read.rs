//! Read path: fast tier first, durable tier on a miss.

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::compression;
use crate::error::{ResourceError, Result};
use crate::lock::LockGuard;
use crate::metrics::{self, LatencyTimer};
use crate::resource::{etag, fields, PresentRecord, ResourceDescriptor, ResourceKey, ResourceMetadata, ResourceRecord};
use crate::storage::traits::{BlobMetadata, ListEntry};
use crate::topic::{BoxError, ResourceEvent, Subscription};

use super::types::{FolderEntry, FolderMetadata, ItemMetadata, ResourceContent, ResourceStream};
use super::ResourceEngine;

/// Chunk size of [`ResourceStream`] bodies.
const STREAM_CHUNK: usize = 64 * 1024;

impl ResourceEngine {
    pub async fn get_resource(&self, desc: &ResourceDescriptor) -> Result<Option<Vec<u8>>> {
        Ok(self.get_resource_with_metadata(desc, true).await?.and_then(|c| c.body))
    }

    pub async fn get_resource_metadata(&self, desc: &ResourceDescriptor) -> Result<Option<ResourceMetadata>> {
        Ok(self.get_resource_with_metadata(desc, false).await?.map(|c| c.metadata))
    }

    pub async fn has_resource(&self, desc: &ResourceDescriptor) -> Result<bool> {
        Ok(self.get_resource_metadata(desc).await?.is_some())
    }

    pub async fn get_etag(&self, desc: &ResourceDescriptor) -> Result<Option<String>> {
        Ok(self.get_resource_metadata(desc).await?.map(|m| m.etag))
    }

    #[tracing::instrument(skip(self), fields(url = %desc))]
    pub async fn get_resource_with_metadata(&self, desc: &ResourceDescriptor, with_body: bool) -> Result<Option<ResourceContent>> {
        desc.require_item()?;
        let _timer = LatencyTimer::new("engine", "get");
        let record = self.load_record(desc, with_body, false).await?;
        Ok(content(desc, record))
    }

    /// Read while the caller already holds `guard` for this resource.
    ///
    /// Skips lock acquisition on a fast-tier miss.
    pub async fn get_resource_with_metadata_held(
        &self,
        desc: &ResourceDescriptor,
        with_body: bool,
        guard: &LockGuard,
    ) -> Result<Option<ResourceContent>> {
        desc.require_item()?;
        if !guard.covers(&desc.key()) {
            return Err(ResourceError::InvalidArgument(format!(
                "lock '{}' does not cover '{}'",
                guard.key(),
                desc.url()
            )));
        }
        let record = self.load_record(desc, with_body, true).await?;
        Ok(content(desc, record))
    }

    /// Acquire the resource's lock, for callers that serialize several steps.
    pub async fn lock_resource(&self, desc: &ResourceDescriptor) -> Result<LockGuard> {
        desc.require_item()?;
        Ok(self.locks.lock(desc.key().as_str()).await?)
    }

    /// Body as a chunked stream. Bodies above `max_size` are read whole from
    /// the durable tier, not cached, and then handed out in chunks.
    pub async fn get_resource_stream(&self, desc: &ResourceDescriptor) -> Result<Option<ResourceStream>> {
        let Some(ResourceContent { metadata, body }) = self.get_resource_with_metadata(desc, true).await? else {
            return Ok(None);
        };
        let body = body.unwrap_or_default();
        let chunks = stream::unfold((body, 0usize), |(body, offset)| async move {
            if offset >= body.len() {
                return None;
            }
            let end = (offset + STREAM_CHUNK).min(body.len());
            let chunk = body[offset..end].to_vec();
            Some((chunk, (body, end)))
        });
        Ok(Some(ResourceStream { metadata, body: chunks.boxed() }))
    }

    /// List one page of `desc` from the durable tier.
    ///
    /// Returns `None` for a non-root folder with nothing in it.
    #[tracing::instrument(skip(self), fields(url = %desc))]
    pub async fn get_folder_metadata(
        &self,
        desc: &ResourceDescriptor,
        token: Option<&str>,
        limit: usize,
        recursive: bool,
    ) -> Result<Option<FolderMetadata>> {
        desc.require_folder()?;
        let _timer = LatencyTimer::new("durable", "list");
        let page = self.durable.list(&desc.blob_path(), token, limit, recursive).await?;
        if page.entries.is_empty() && token.is_none() && !desc.is_root_folder() {
            return Ok(None);
        }

        let entries = page
            .entries
            .into_iter()
            .filter_map(|entry| {
                let path = entry.path().to_string();
                match folder_entry(entry) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(path = %path, error = %e, "Skipping unrecognized durable object");
                        None
                    }
                }
            })
            .collect();
        Ok(Some(FolderMetadata { descriptor: desc.clone(), entries, next_token: page.next_token }))
    }

    /// Register `callback` for mutations of any of `descs`.
    pub fn subscribe_resources<F>(&self, descs: &[ResourceDescriptor], callback: F) -> Subscription
    where
        F: Fn(&ResourceEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.topic.subscribe(descs.iter().map(ResourceDescriptor::url), callback)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Resolve the record for `desc`. On a fast-tier miss the key is locked
    /// (unless `locked`), the fast tier re-checked, and the durable copy
    /// cached as synced.
    pub(super) async fn load_record(&self, desc: &ResourceDescriptor, with_body: bool, locked: bool) -> Result<ResourceRecord> {
        let key = desc.key();
        let record = self.read_record(&key, with_body).await?;
        if record.is_known() {
            return self.resolve_body(desc, record, with_body).await;
        }

        let _guard = if locked { None } else { Some(self.locks.lock(key.as_str()).await?) };

        // Another caller may have filled it while we waited
        let record = self.read_record(&key, with_body).await?;
        if record.is_known() {
            return self.resolve_body(desc, record, with_body).await;
        }

        let record = self.load_durable(desc, &key).await?;
        self.resolve_body(desc, record, with_body).await
    }

    /// Strip or complete the body so it matches `with_body`.
    async fn resolve_body(&self, desc: &ResourceDescriptor, record: ResourceRecord, with_body: bool) -> Result<ResourceRecord> {
        let ResourceRecord::Present(mut present) = record else {
            return Ok(record);
        };
        if !with_body {
            present.body = None;
        } else if present.body.is_none() || present.is_stub(self.config.max_size) {
            match self.load_body(desc).await? {
                Some(body) => present.body = Some(body),
                None => {
                    warn!(url = %desc, "Durable object vanished behind a cached record");
                    return Ok(ResourceRecord::Absent);
                }
            }
        }
        Ok(ResourceRecord::Present(present))
    }

    /// Body straight from the durable tier, not cached.
    async fn load_body(&self, desc: &ResourceDescriptor) -> Result<Option<Vec<u8>>> {
        let Some(blob) = self.durable.load(&desc.blob_path()).await? else {
            return Ok(None);
        };
        let body = compression::decode(blob.body, blob.meta.content_encoding.as_deref())?;
        metrics::record_uncached_read(body.len() as u64);
        Ok(Some(body))
    }

    /// Load from the durable tier and cache the result as synced.
    ///
    /// A miss is cached as a synced tombstone. Bodies above `max_size` are
    /// cached as a stub; the returned record still carries the full body
    /// when it was loaded.
    async fn load_durable(&self, desc: &ResourceDescriptor, key: &ResourceKey) -> Result<ResourceRecord> {
        let path = desc.blob_path();
        let max_size = self.config.max_size;

        let Some(meta) = self.durable.meta(&path).await? else {
            return self.cache_miss(key).await;
        };

        // Large object with a known etag: cache the stub without reading the body
        let full_length = stored_length(&meta);
        if full_length > max_size as u64 && meta.user_metadata.contains_key(fields::ETAG) {
            let stub = present_from_meta(desc, &meta, Vec::new(), full_length);
            self.write_record(key, &ResourceRecord::Present(stub.clone())).await?;
            debug!(url = %desc, "Cached stub for oversized resource");
            return Ok(ResourceRecord::Present(stub));
        }

        let Some(blob) = self.durable.load(&path).await? else {
            return self.cache_miss(key).await;
        };
        let body = compression::decode(blob.body, blob.meta.content_encoding.as_deref())?;
        let length = body.len() as u64;
        let full = present_from_meta(desc, &blob.meta, body, length);

        let cached = if length > max_size as u64 {
            PresentRecord { body: Some(Vec::new()), ..full.clone() }
        } else {
            full.clone()
        };
        self.write_record(key, &ResourceRecord::Present(cached)).await?;
        debug!(url = %desc, length, "Cached resource from durable tier");
        Ok(ResourceRecord::Present(full))
    }

    async fn cache_miss(&self, key: &ResourceKey) -> Result<ResourceRecord> {
        let tombstone = ResourceRecord::Tombstone { synced: true };
        self.write_record(key, &tombstone).await?;
        Ok(tombstone)
    }
}

fn content(desc: &ResourceDescriptor, record: ResourceRecord) -> Option<ResourceContent> {
    record.into_present().map(|present| ResourceContent {
        metadata: present.metadata(desc),
        body: present.body,
    })
}

fn user_number(meta: &BlobMetadata, name: &str) -> Option<i64> {
    meta.user_metadata.get(name).and_then(|v| v.parse().ok())
}

/// Uncompressed length from user metadata, or the native length when that
/// is missing or negative.
fn stored_length(meta: &BlobMetadata) -> u64 {
    user_number(meta, fields::CONTENT_LENGTH)
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(meta.content_length)
}

/// Synced record for a durable object. The etag is recomputed when the
/// object predates etag metadata (listing stubs).
fn present_from_meta(desc: &ResourceDescriptor, meta: &BlobMetadata, body: Vec<u8>, content_length: u64) -> PresentRecord {
    let etag = meta
        .user_metadata
        .get(fields::ETAG)
        .cloned()
        .unwrap_or_else(|| etag(&body));
    let updated_at = user_number(meta, fields::UPDATED_AT).or(meta.last_modified).unwrap_or(0);
    PresentRecord {
        body: Some(body),
        etag,
        created_at: user_number(meta, fields::CREATED_AT).unwrap_or(updated_at),
        updated_at,
        content_type: meta
            .content_type
            .clone()
            .unwrap_or_else(|| desc.kind().default_content_type().to_string()),
        content_length,
        kind: desc.kind(),
        synced: true,
    }
}

fn folder_entry(entry: ListEntry) -> Result<FolderEntry> {
    match entry {
        ListEntry::Folder { path } => Ok(FolderEntry::Folder(ResourceDescriptor::from_blob_path(&path)?)),
        ListEntry::Item(meta) => {
            let updated_at = user_number(&meta, fields::UPDATED_AT).or(meta.last_modified);
            Ok(FolderEntry::Item(ItemMetadata {
                descriptor: ResourceDescriptor::from_blob_path(&meta.path)?,
                etag: meta.user_metadata.get(fields::ETAG).cloned(),
                created_at: user_number(&meta, fields::CREATED_AT).or(updated_at),
                updated_at,
                content_type: meta.content_type.clone(),
                content_length: stored_length(&meta),
            }))
        }
    }
}
