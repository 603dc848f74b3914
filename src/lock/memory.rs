use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use super::{LockError, LockGuard, LockService};

/// Per-key semaphores, for single-process deployments and tests.
///
/// Replicas sharing a fast tier need [`RedisLockService`](super::RedisLockService).
pub struct InMemoryLockService {
    locks: Arc<DashMap<String, Arc<Semaphore>>>,
}

impl InMemoryLockService {
    #[must_use]
    pub fn new() -> Self {
        Self { locks: Arc::new(DashMap::new()) }
    }

    fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Whether some guard currently holds `key`.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.get(key).is_some_and(|s| s.available_permits() == 0)
    }

    fn guard(&self, key: &str, permit: tokio::sync::OwnedSemaphorePermit) -> LockGuard {
        let locks = self.locks.clone();
        let key_owned = key.to_string();
        LockGuard::with_release_fn(key.to_string(), move || {
            drop(permit);
            // Forget idle semaphores so the map doesn't grow with every key ever locked
            locks.remove_if(&key_owned, |_, s| Arc::strong_count(s) == 1 && s.available_permits() == 1);
        })
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn lock(&self, key: &str) -> Result<LockGuard, LockError> {
        let semaphore = self.semaphore(key);
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| LockError::Backend("Semaphore closed".to_string()))?;
        Ok(self.guard(key, permit))
    }

    async fn try_lock(&self, key: &str) -> Result<Option<LockGuard>, LockError> {
        let semaphore = self.semaphore(key);
        match semaphore.try_acquire_owned() {
            Ok(permit) => Ok(Some(self.guard(key, permit))),
            Err(_) => Ok(None),
        }
    }
}
