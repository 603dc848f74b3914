//! Copy and folder-wide operations.

use tracing::{debug, info};

use crate::error::{ResourceError, Result};
use crate::lock::lock_pair;
use crate::metrics::LatencyTimer;
use crate::resource::{EtagPrecondition, ResourceDescriptor};
use crate::storage::traits::ListEntry;
use crate::topic::ResourceAction;

use super::{record_outcome, ResourceEngine};

/// Page size used when walking a folder.
const FOLDER_PAGE: usize = 1000;

impl ResourceEngine {
    /// Copy `from` onto `to` in the durable tier.
    ///
    /// Returns `false` without writing when `to` exists and `overwrite` is
    /// off. The destination's fast-tier entry is evicted and reloads lazily.
    #[tracing::instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn copy_resource(&self, from: &ResourceDescriptor, to: &ResourceDescriptor, overwrite: bool) -> Result<bool> {
        from.require_item()?;
        to.require_item()?;
        let from_key = from.key();
        let to_key = to.key();
        if from_key == to_key {
            return Err(ResourceError::InvalidArgument(format!("cannot copy '{}' onto itself", from.url())));
        }

        let _timer = LatencyTimer::new("engine", "copy");
        let _pair = lock_pair(self.locks.as_ref(), &from_key, &to_key).await?;

        let result = async {
            let source = self
                .load_record(from, false, true)
                .await?
                .into_present()
                .ok_or_else(|| ResourceError::NotFound(from.url()))?;
            let destination = self.load_record(to, false, true).await?.into_present();
            if destination.is_some() && !overwrite {
                debug!(to = %to, "Destination exists, not overwriting");
                return Ok(false);
            }

            self.flush_locked(from, &from_key).await?;
            self.flush_locked(to, &to_key).await?;
            self.durable.copy(&from.blob_path(), &to.blob_path()).await?;

            let action = if destination.is_some() { ResourceAction::Update } else { ResourceAction::Create };
            self.notify(to, action, crate::resource::now_millis(), Some(source.etag)).await;
            Ok(true)
        }
        .await;

        record_outcome("copy", &result);
        result
    }

    /// Copy every resource under `from` to the same relative path under `to`.
    ///
    /// Returns the number of resources copied.
    #[tracing::instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn copy_folder(&self, from: &ResourceDescriptor, to: &ResourceDescriptor, overwrite: bool) -> Result<usize> {
        from.require_folder()?;
        to.require_folder()?;
        if from.kind() == to.kind() && from.bucket() == to.bucket() && to.path().starts_with(from.path()) {
            return Err(ResourceError::InvalidArgument(format!(
                "cannot copy '{}' into itself ('{}')",
                from.url(),
                to.url()
            )));
        }

        let mut copied = 0;
        for item in self.folder_items(from).await? {
            let relative = &item.path()[from.path().len()..];
            let target = to.with_path(&format!("{}{}", to.path(), relative))?;
            if self.copy_resource(&item, &target, overwrite).await? {
                copied += 1;
            }
        }
        info!(from = %from, to = %to, copied, "Folder copied");
        Ok(copied)
    }

    /// Delete every resource under `desc`. Returns the number deleted.
    #[tracing::instrument(skip(self), fields(url = %desc))]
    pub async fn delete_folder(&self, desc: &ResourceDescriptor) -> Result<usize> {
        desc.require_folder()?;
        let mut deleted = 0;
        for item in self.folder_items(desc).await? {
            if self.delete_resource(&item, &EtagPrecondition::Any).await? {
                deleted += 1;
            }
        }
        info!(url = %desc, deleted, "Folder deleted");
        Ok(deleted)
    }

    /// Every item under `folder`, collected page by page before any mutation.
    async fn folder_items(&self, folder: &ResourceDescriptor) -> Result<Vec<ResourceDescriptor>> {
        let prefix = folder.blob_path();
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.durable.list(&prefix, token.as_deref(), FOLDER_PAGE, true).await?;
            for entry in page.entries {
                if let ListEntry::Item(meta) = entry {
                    items.push(ResourceDescriptor::from_blob_path(&meta.path)?);
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(items)
    }
}
