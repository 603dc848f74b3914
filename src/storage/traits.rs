//! Backend contracts for the two storage tiers and the sync queue.
//!
//! - [`FastTier`]: keyed field groups (one hash per resource) with TTLs
//! - [`ScoredSet`]: ordered set scored by due time, backing the sync queue
//! - [`DurableTier`]: object store with user metadata and prefix listing

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record for '{key}': {reason}")]
    Corruption { key: String, reason: String },
}

/// Field name → raw value, as stored in one fast-tier hash.
pub type FieldMap = HashMap<String, Vec<u8>>;

#[async_trait]
pub trait FastTier: Send + Sync {
    /// Read the named fields. Missing fields (or a missing key) are absent
    /// from the returned map.
    async fn get_fields(&self, key: &str, fields: &[&str]) -> Result<FieldMap, StorageError>;

    /// Atomically replace the whole hash with `fields`.
    ///
    /// `expiration` of `None` leaves the key persistent.
    async fn replace_fields(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        expiration: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Atomically merge `fields` into the existing hash.
    async fn update_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<(), StorageError>;

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), StorageError>;

    async fn clear_expiration(&self, key: &str) -> Result<(), StorageError>;

    /// Remaining TTL. `None` when the key has no expiration or does not exist.
    async fn expiration(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ScoredSet: Send + Sync {
    /// Insert or re-score `member`.
    async fn add(&self, set: &str, member: &str, score: i64) -> Result<(), StorageError>;

    /// Members with `score <= max_score`, lowest score first, at most `limit`.
    async fn range_up_to(&self, set: &str, max_score: i64, limit: usize) -> Result<Vec<String>, StorageError>;

    async fn remove(&self, set: &str, member: &str) -> Result<(), StorageError>;

    async fn score(&self, set: &str, member: &str) -> Result<Option<i64>, StorageError>;

    async fn len(&self, set: &str) -> Result<usize, StorageError>;
}

/// Metadata of one durable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub path: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Stored (possibly compressed) length in bytes
    pub content_length: u64,
    pub user_metadata: BTreeMap<String, String>,
    /// Native modification time (epoch millis), if the backend tracks one
    pub last_modified: Option<i64>,
}

/// A durable object with its stored bytes (still encoded).
#[derive(Debug, Clone)]
pub struct Blob {
    pub meta: BlobMetadata,
    pub body: Vec<u8>,
}

/// Everything needed to store one object.
#[derive(Debug, Clone)]
pub struct BlobWrite {
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    /// A common prefix; `path` ends with `/`
    Folder { path: String },
    Item(BlobMetadata),
}

impl ListEntry {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            ListEntry::Folder { path } => path,
            ListEntry::Item(meta) => &meta.path,
        }
    }
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct BlobPage {
    pub entries: Vec<ListEntry>,
    /// Pass back to `list` to fetch the next page; `None` on the last page
    pub next_token: Option<String>,
}

#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn load(&self, path: &str) -> Result<Option<Blob>, StorageError>;

    /// Create or overwrite `path`.
    async fn store(&self, path: &str, write: BlobWrite) -> Result<(), StorageError>;

    /// Delete `path`. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Copy `from` onto `to`, overwriting. Fails with `NotFound` when `from` is missing.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.meta(path).await?.is_some())
    }

    async fn meta(&self, path: &str) -> Result<Option<BlobMetadata>, StorageError>;

    /// List entries under `prefix` (a folder path ending with `/`, or empty
    /// for the root) in byte order, starting after `token`.
    ///
    /// Non-recursive listings collapse deeper paths into `Folder` entries.
    async fn list(
        &self,
        prefix: &str,
        token: Option<&str>,
        limit: usize,
        recursive: bool,
    ) -> Result<BlobPage, StorageError>;
}

/// Map a stored object path under `prefix` to its listing entry.
///
/// Shared by backends that enumerate raw object paths.
pub(crate) fn entry_path<'a>(prefix: &str, path: &'a str, recursive: bool) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }
    if recursive {
        return Some(path);
    }
    match rest.find('/') {
        Some(slash) => Some(&path[..prefix.len() + slash + 1]),
        None => Some(path),
    }
}

/// Build one listing page from object metadata already sorted by path.
///
/// Consumes rows until `limit + 1` entries are collected so the caller
/// learns whether another page exists.
pub(crate) struct PageBuilder<'p> {
    prefix: &'p str,
    token: Option<&'p str>,
    limit: usize,
    recursive: bool,
    entries: Vec<ListEntry>,
    has_more: bool,
}

impl<'p> PageBuilder<'p> {
    pub(crate) fn new(prefix: &'p str, token: Option<&'p str>, limit: usize, recursive: bool) -> Self {
        Self { prefix, token, limit, recursive, entries: Vec::new(), has_more: false }
    }

    /// Feed the next object. Returns `false` once the page is full.
    pub(crate) fn push(&mut self, meta: BlobMetadata) -> bool {
        if self.has_more {
            return false;
        }
        let Some(entry_path) = entry_path(self.prefix, &meta.path, self.recursive) else {
            return true;
        };
        if let Some(token) = self.token {
            if entry_path <= token {
                return true;
            }
        }
        if let Some(last) = self.entries.last() {
            if last.path() == entry_path {
                return true;
            }
        }
        if self.entries.len() == self.limit {
            self.has_more = true;
            return false;
        }
        let entry = if entry_path.len() == meta.path.len() {
            ListEntry::Item(meta)
        } else {
            ListEntry::Folder { path: entry_path.to_string() }
        };
        self.entries.push(entry);
        true
    }

    pub(crate) fn finish(self) -> BlobPage {
        let next_token = if self.has_more {
            self.entries.last().map(|e| e.path().to_string())
        } else {
            None
        };
        BlobPage { entries: self.entries, next_token }
    }
}
