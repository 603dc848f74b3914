//! Per-resource mutual exclusion.
//!
//! Every mutation of a resource runs under that resource's lock; reads take
//! it only to populate the fast tier after a miss. Two-key operations go
//! through [`lock_pair`], which always acquires the larger key first so
//! reciprocal copies cannot deadlock.
//!
//! ```
//! # use resource_engine::lock::{InMemoryLockService, LockService};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let locks = InMemoryLockService::new();
//! let guard = locks.lock("files:b/files/a").await.unwrap();
//! assert!(locks.try_lock("files:b/files/a").await.unwrap().is_none());
//! drop(guard);
//! assert!(locks.try_lock("files:b/files/a").await.unwrap().is_some());
//! # }
//! ```

pub mod memory;
pub mod redis;

pub use memory::InMemoryLockService;
pub use self::redis::RedisLockService;

use std::fmt;

use async_trait::async_trait;

use crate::error::ResourceError;
use crate::resource::ResourceKey;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Backend(String),
}

/// Releases the lock when dropped.
pub struct LockGuard {
    key: String,
    release_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            release_fn();
        }
    }
}

impl LockGuard {
    pub fn with_release_fn<F: FnOnce() + Send + 'static>(key: String, release_fn: F) -> Self {
        Self { key, release_fn: Some(Box::new(release_fn)) }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this guard holds the lock for `key`.
    #[must_use]
    pub fn covers(&self, key: &ResourceKey) -> bool {
        self.key == key.as_str()
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait until the lock for `key` is granted.
    async fn lock(&self, key: &str) -> Result<LockGuard, LockError>;

    /// Take the lock only if it is free right now.
    async fn try_lock(&self, key: &str) -> Result<Option<LockGuard>, LockError>;
}

/// Both locks of a two-key operation, taken in the global order.
#[derive(Debug)]
pub struct PairGuard {
    pub first: LockGuard,
    pub second: LockGuard,
}

impl PairGuard {
    /// The guard covering `key`, if either does.
    #[must_use]
    pub fn guard_for(&self, key: &ResourceKey) -> Option<&LockGuard> {
        [&self.first, &self.second].into_iter().find(|g| g.covers(key))
    }
}

/// Lock `a` and `b`, larger key first. Equal keys are rejected.
pub async fn lock_pair(
    service: &dyn LockService,
    a: &ResourceKey,
    b: &ResourceKey,
) -> Result<PairGuard, ResourceError> {
    let (first, second) = match a.cmp(b) {
        std::cmp::Ordering::Greater => (a, b),
        std::cmp::Ordering::Less => (b, a),
        std::cmp::Ordering::Equal => {
            return Err(ResourceError::InvalidArgument(format!("cannot lock '{}' twice", a)));
        }
    };
    let first = service.lock(first.as_str()).await?;
    let second = service.lock(second.as_str()).await?;
    Ok(PairGuard { first, second })
}
