//! Write path: put, compute and delete, each under the resource's lock.

use futures::stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::{ResourceError, Result};
use crate::metrics::LatencyTimer;
use crate::resource::{etag, now_millis, EtagPrecondition, PresentRecord, ResourceDescriptor, ResourceKey, ResourceMetadata, ResourceRecord};
use crate::topic::{BoxError, ResourceAction};

use super::{record_outcome, ResourceEngine};

impl ResourceEngine {
    /// Store `body` with the kind's default content type.
    #[tracing::instrument(skip_all, fields(url = %desc, len = body.len()))]
    pub async fn put_resource(
        &self,
        desc: &ResourceDescriptor,
        body: Vec<u8>,
        precondition: &EtagPrecondition,
    ) -> Result<ResourceMetadata> {
        let content_type = desc.kind().default_content_type().to_string();
        let result = self.put_checked(desc, body, content_type, precondition).await;
        record_outcome("put", &result);
        result
    }

    /// Store a file uploaded in chunks. The body is buffered, then stored
    /// under `content_type` and never compressed.
    #[tracing::instrument(skip_all, fields(url = %desc, content_type = %content_type))]
    pub async fn put_file<S>(
        &self,
        desc: &ResourceDescriptor,
        content_type: &str,
        chunks: S,
        precondition: &EtagPrecondition,
    ) -> Result<ResourceMetadata>
    where
        S: Stream<Item = Vec<u8>> + Send,
    {
        if !desc.kind().is_file() {
            return Err(ResourceError::InvalidArgument(format!("'{}' is not a file", desc.url())));
        }
        desc.require_item()?;
        let body: Vec<u8> = chunks.concat().await;
        let result = self.put_checked(desc, body, content_type.to_string(), precondition).await;
        record_outcome("put_file", &result);
        result
    }

    /// Serialized read-modify-write.
    ///
    /// `transform` receives the current body (`None` if missing) and runs
    /// exactly once under the lock. Returning `None` deletes the resource;
    /// returning the same bytes is a no-op with no event.
    #[tracing::instrument(skip_all, fields(url = %desc))]
    pub async fn compute_resource<F>(
        &self,
        desc: &ResourceDescriptor,
        precondition: &EtagPrecondition,
        transform: F,
    ) -> Result<Option<ResourceMetadata>>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>, BoxError> + Send,
    {
        desc.require_item()?;
        let _timer = LatencyTimer::new("engine", "compute");
        let key = desc.key();
        let _guard = self.locks.lock(key.as_str()).await?;

        let result = async {
            let existing = self.load_record(desc, true, true).await?.into_present();
            if let Some(ref current) = existing {
                precondition.validate(&desc.url(), &current.etag)?;
            }

            let old_body = existing.as_ref().and_then(|p| p.body.as_deref());
            let new_body = transform(old_body).map_err(|e| ResourceError::Transform(e.to_string()))?;

            match (existing, new_body) {
                (None, None) => Ok(None),
                (Some(_), None) => {
                    self.delete_locked(desc, &key).await?;
                    Ok(None)
                }
                (Some(current), Some(body)) if current.body.as_deref() == Some(body.as_slice()) => {
                    debug!(url = %desc, "Transform left the resource unchanged");
                    Ok(Some(current.metadata(desc)))
                }
                (existing, Some(body)) => {
                    let content_type = existing
                        .as_ref()
                        .map(|p| p.content_type.clone())
                        .unwrap_or_else(|| desc.kind().default_content_type().to_string());
                    self.put_locked(desc, &key, body, content_type, existing).await.map(Some)
                }
            }
        }
        .await;

        record_outcome("compute", &result);
        result
    }

    /// Delete with end-to-end durable removal. Returns whether the resource existed.
    #[tracing::instrument(skip_all, fields(url = %desc))]
    pub async fn delete_resource(&self, desc: &ResourceDescriptor, precondition: &EtagPrecondition) -> Result<bool> {
        desc.require_item()?;
        let _timer = LatencyTimer::new("engine", "delete");
        let key = desc.key();
        let _guard = self.locks.lock(key.as_str()).await?;

        let result = async {
            let Some(current) = self.load_record(desc, false, true).await?.into_present() else {
                return Ok(false);
            };
            precondition.validate(&desc.url(), &current.etag)?;
            self.delete_locked(desc, &key).await?;
            Ok(true)
        }
        .await;

        record_outcome("delete", &result);
        result
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internals (lock held by the caller)
    // ═══════════════════════════════════════════════════════════════════════════

    async fn put_checked(
        &self,
        desc: &ResourceDescriptor,
        body: Vec<u8>,
        content_type: String,
        precondition: &EtagPrecondition,
    ) -> Result<ResourceMetadata> {
        desc.require_item()?;
        let _timer = LatencyTimer::new("engine", "put");
        let key = desc.key();
        let _guard = self.locks.lock(key.as_str()).await?;

        let existing = self.load_record(desc, false, true).await?.into_present();
        if let Some(ref current) = existing {
            precondition.validate(&desc.url(), &current.etag)?;
        }
        self.put_locked(desc, &key, body, content_type, existing).await
    }

    /// Write a new version. `existing` is the current record, already
    /// checked against the caller's precondition.
    async fn put_locked(
        &self,
        desc: &ResourceDescriptor,
        key: &ResourceKey,
        body: Vec<u8>,
        content_type: String,
        existing: Option<PresentRecord>,
    ) -> Result<ResourceMetadata> {
        let now = now_millis();
        let is_new = existing.is_none();
        let mut record = PresentRecord {
            body: None,
            etag: etag(&body),
            created_at: existing.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
            content_type,
            content_length: body.len() as u64,
            kind: desc.kind(),
            synced: false,
        };

        if body.len() <= self.config.max_size {
            if is_new {
                self.store_listing_stub(desc, &record).await?;
            }
            // Queue first: a queued key without a dirty record is dropped by the worker
            self.enqueue(key).await?;
            record.body = Some(body);
            self.write_record(key, &ResourceRecord::Present(record.clone())).await?;
        } else {
            self.flush_locked(desc, key).await?;
            self.store_durable(desc, &record, body).await?;
            record.body = Some(Vec::new());
            record.synced = true;
            self.write_record(key, &ResourceRecord::Present(record.clone())).await?;
            debug!(url = %desc, length = record.content_length, "Oversized resource written to durable tier");
        }

        let action = if is_new { ResourceAction::Create } else { ResourceAction::Update };
        self.notify(desc, action, now, Some(record.etag.clone())).await;
        Ok(record.metadata(desc))
    }

    /// Tombstone, durable delete, then reconcile immediately.
    pub(super) async fn delete_locked(&self, desc: &ResourceDescriptor, key: &ResourceKey) -> Result<()> {
        self.enqueue(key).await?;
        self.write_record(key, &ResourceRecord::Tombstone { synced: false }).await?;
        self.durable.delete(&desc.blob_path()).await?;
        self.write_record(key, &ResourceRecord::Tombstone { synced: true }).await?;
        self.dequeue(key).await?;

        self.notify(desc, ResourceAction::Delete, now_millis(), None).await;
        Ok(())
    }
}
