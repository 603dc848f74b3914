//! Public types returned by the resource engine.

use futures::stream::BoxStream;

use crate::resource::{ResourceDescriptor, ResourceMetadata};

/// Metadata plus the body, when it was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContent {
    pub metadata: ResourceMetadata,
    /// `None` when read without body
    pub body: Option<Vec<u8>>,
}

/// Chunked body of one resource.
pub struct ResourceStream {
    pub metadata: ResourceMetadata,
    pub body: BoxStream<'static, Vec<u8>>,
}

impl std::fmt::Debug for ResourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStream").field("metadata", &self.metadata).finish_non_exhaustive()
    }
}

/// One entry of a listing, built from durable-tier metadata.
///
/// Items written but not yet synced show up with the listing stub's
/// values: no etag and a zero length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub descriptor: ResourceDescriptor,
    pub etag: Option<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub content_type: Option<String>,
    pub content_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderEntry {
    Folder(ResourceDescriptor),
    Item(ItemMetadata),
}

impl FolderEntry {
    #[must_use]
    pub fn descriptor(&self) -> &ResourceDescriptor {
        match self {
            FolderEntry::Folder(d) => d,
            FolderEntry::Item(item) => &item.descriptor,
        }
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self, FolderEntry::Folder(_))
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMetadata {
    pub descriptor: ResourceDescriptor,
    pub entries: Vec<FolderEntry>,
    /// Continuation token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Outcome of one sync worker tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Queue entries that were due
    pub due: usize,
    /// Dirty records written to (or deleted from) the durable tier
    pub synced: usize,
    /// Entries already reconciled elsewhere, dropped from the queue
    pub normalized: usize,
    /// Entries whose lock was held; retried next tick
    pub skipped: usize,
    /// Entries that failed; they stay queued
    pub failed: usize,
}
