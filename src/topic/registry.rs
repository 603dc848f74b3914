use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;

use super::ResourceEvent;
use crate::metrics;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback. Errors and panics are logged, never propagated.
pub type EventCallback = Arc<dyn Fn(&ResourceEvent) -> Result<(), BoxError> + Send + Sync>;

struct SubscriptionInner {
    id: u64,
    urls: Vec<String>,
    callback: EventCallback,
    active: AtomicBool,
}

/// URL → subscriptions interested in it. One per [`ChangeTopic`](super::ChangeTopic).
#[derive(Default)]
pub(crate) struct Registry {
    listeners: DashMap<String, HashMap<u64, Arc<SubscriptionInner>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn subscribe(self: &Arc<Self>, urls: Vec<String>, callback: EventCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(SubscriptionInner { id, urls, callback, active: AtomicBool::new(true) });
        for url in &inner.urls {
            self.listeners.entry(url.clone()).or_default().insert(id, inner.clone());
        }
        Subscription { inner, registry: Arc::clone(self) }
    }

    /// Invoke every active subscription registered for `event.url`.
    ///
    /// Returns the number of callbacks that succeeded.
    pub(crate) fn dispatch(&self, event: &ResourceEvent) -> usize {
        // Snapshot so callbacks run without holding the map shard
        let targets: Vec<Arc<SubscriptionInner>> = match self.listeners.get(&event.url) {
            Some(subs) => subs.values().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for sub in targets {
            if !sub.active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(url = %event.url, subscription = sub.id, error = %e, "Subscriber callback failed");
                    metrics::record_subscriber_failure("error");
                }
                Err(_) => {
                    warn!(url = %event.url, subscription = sub.id, "Subscriber callback panicked");
                    metrics::record_subscriber_failure("panic");
                }
            }
        }
        delivered
    }

    fn remove(&self, inner: &SubscriptionInner) {
        for url in &inner.urls {
            self.listeners.remove_if_mut(url, |_, subs| {
                subs.remove(&inner.id);
                subs.is_empty()
            });
        }
    }

    /// Number of URLs with at least one listener.
    pub(crate) fn watched_urls(&self) -> usize {
        self.listeners.len()
    }
}

/// Handle returned by `subscribe_resources`. Lives until [`close`](Self::close)
/// is called; dropping the handle does not unsubscribe.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    registry: Arc<Registry>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Stop delivery and unregister from every URL. Safe to call repeatedly.
    pub fn close(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            self.registry.remove(&self.inner);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("urls", &self.inner.urls)
            .field("active", &self.is_active())
            .finish()
    }
}
