//! In-process backends for tests, demos and single-replica deployments.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::traits::{
    Blob, BlobMetadata, BlobPage, BlobWrite, DurableTier, FastTier, FieldMap, PageBuilder, ScoredSet,
    StorageError,
};
use crate::resource::now_millis;

struct FastEntry {
    fields: FieldMap,
    expires_at: Option<Instant>,
}

impl FastEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Hash-per-key store with lazily enforced TTLs.
pub struct InMemoryFastTier {
    data: DashMap<String, FastEntry>,
}

impl InMemoryFastTier {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Live (unexpired) key count
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.is_expired(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys now instead of on next access
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.data.retain(|_, e| !e.is_expired(now));
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn drop_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, e| e.is_expired(now));
    }
}

impl Default for InMemoryFastTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastTier for InMemoryFastTier {
    async fn get_fields(&self, key: &str, fields: &[&str]) -> Result<FieldMap, StorageError> {
        self.drop_if_expired(key);
        let Some(entry) = self.data.get(key) else {
            return Ok(FieldMap::new());
        };
        Ok(fields
            .iter()
            .filter_map(|f| entry.fields.get(*f).map(|v| (f.to_string(), v.clone())))
            .collect())
    }

    async fn replace_fields(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        expiration: Option<Duration>,
    ) -> Result<(), StorageError> {
        let entry = FastEntry {
            fields: fields.into_iter().collect(),
            expires_at: expiration.map(|ttl| Instant::now() + ttl),
        };
        self.data.insert(key.to_string(), entry);
        Ok(())
    }

    async fn update_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        self.drop_if_expired(key);
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| FastEntry { fields: HashMap::new(), expires_at: None });
        entry.fields.extend(fields);
        Ok(())
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        self.drop_if_expired(key);
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn clear_expiration(&self, key: &str) -> Result<(), StorageError> {
        self.drop_if_expired(key);
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = None;
        }
        Ok(())
    }

    async fn expiration(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        self.drop_if_expired(key);
        let now = Instant::now();
        Ok(self
            .data
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }
}

/// Scored sets keyed by name. Ties order by member.
pub struct InMemoryScoredSet {
    sets: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl InMemoryScoredSet {
    #[must_use]
    pub fn new() -> Self {
        Self { sets: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryScoredSet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoredSet for InMemoryScoredSet {
    async fn add(&self, set: &str, member: &str, score: i64) -> Result<(), StorageError> {
        self.sets
            .lock()
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn range_up_to(&self, set: &str, max_score: i64, limit: usize) -> Result<Vec<String>, StorageError> {
        let sets = self.sets.lock();
        let Some(members) = sets.get(set) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(i64, &String)> = members
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, s)| (*s, m))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, m)| m.clone()).collect())
    }

    async fn remove(&self, set: &str, member: &str) -> Result<(), StorageError> {
        let mut sets = self.sets.lock();
        if let Some(members) = sets.get_mut(set) {
            members.remove(member);
            if members.is_empty() {
                sets.remove(set);
            }
        }
        Ok(())
    }

    async fn score(&self, set: &str, member: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.sets.lock().get(set).and_then(|m| m.get(member).copied()))
    }

    async fn len(&self, set: &str) -> Result<usize, StorageError> {
        Ok(self.sets.lock().get(set).map_or(0, HashMap::len))
    }
}

/// Object store over an ordered map, so listings come out in byte order.
pub struct InMemoryDurableTier {
    objects: Mutex<BTreeMap<String, Blob>>,
}

impl InMemoryDurableTier {
    #[must_use]
    pub fn new() -> Self {
        Self { objects: Mutex::new(BTreeMap::new()) }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl Default for InMemoryDurableTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableTier for InMemoryDurableTier {
    async fn load(&self, path: &str) -> Result<Option<Blob>, StorageError> {
        Ok(self.objects.lock().get(path).cloned())
    }

    async fn store(&self, path: &str, write: BlobWrite) -> Result<(), StorageError> {
        let blob = Blob {
            meta: BlobMetadata {
                path: path.to_string(),
                content_type: Some(write.content_type),
                content_encoding: write.content_encoding,
                content_length: write.body.len() as u64,
                user_metadata: write.user_metadata,
                last_modified: Some(now_millis()),
            },
            body: write.body,
        };
        self.objects.lock().insert(path.to_string(), blob);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.objects.lock().remove(path);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.lock();
        let mut blob = objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        blob.meta.path = to.to_string();
        blob.meta.last_modified = Some(now_millis());
        objects.insert(to.to_string(), blob);
        Ok(())
    }

    async fn meta(&self, path: &str) -> Result<Option<BlobMetadata>, StorageError> {
        Ok(self.objects.lock().get(path).map(|b| b.meta.clone()))
    }

    async fn list(
        &self,
        prefix: &str,
        token: Option<&str>,
        limit: usize,
        recursive: bool,
    ) -> Result<BlobPage, StorageError> {
        let objects = self.objects.lock();
        let mut page = PageBuilder::new(prefix, token, limit, recursive);
        let start = match token {
            Some(t) if t > prefix => t,
            _ => prefix,
        };
        for (path, blob) in objects.range::<str, _>((Bound::Included(start), Bound::Unbounded)) {
            if !path.starts_with(prefix) {
                break;
            }
            if !page.push(blob.meta.clone()) {
                break;
            }
        }
        Ok(page.finish())
    }
}
