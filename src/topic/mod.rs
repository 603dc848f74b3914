//! Change notification for resource mutations.
//!
//! Every successful mutation publishes one [`ResourceEvent`] on an
//! [`EventBus`]. Each engine runs one dispatcher task that reads the bus and
//! hands events to the local [`Subscription`]s registered for the event URL.
//! Events from this process also arrive through the bus, so local and
//! remote mutations are delivered the same way.

mod bus;
mod registry;

pub use bus::{EventBus, LocalEventBus, RedisEventBus};
pub use registry::{BoxError, EventCallback, Subscription};

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::resilience::retry::RetryConfig;
use registry::Registry;

#[derive(Error, Debug)]
pub enum TopicError {
    #[error("Topic backend error: {0}")]
    Backend(String),

    #[error("Event codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
}

impl ResourceAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceAction::Create => "CREATE",
            ResourceAction::Update => "UPDATE",
            ResourceAction::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub url: String,
    pub action: ResourceAction,
    /// Epoch millis of the mutation
    pub timestamp: i64,
    /// New etag; `None` for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Publishes events and fans incoming ones out to local subscriptions.
pub struct ChangeTopic {
    bus: Arc<dyn EventBus>,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeTopic {
    /// Subscribe to `bus` and spawn the dispatcher.
    ///
    /// The first subscription is made before returning, so events published
    /// after `start` completes are never missed.
    pub async fn start(bus: Arc<dyn EventBus>) -> Result<Self, TopicError> {
        let registry = Arc::new(Registry::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let first = bus.listen().await?;

        let dispatcher = tokio::spawn(run_dispatcher(bus.clone(), registry.clone(), first, shutdown_rx));
        info!("Change topic dispatcher started");

        Ok(Self { bus, registry, shutdown_tx, dispatcher: Mutex::new(Some(dispatcher)) })
    }

    pub async fn publish(&self, event: &ResourceEvent) -> Result<(), TopicError> {
        let payload = serde_json::to_vec(event)?;
        self.bus.publish(payload).await?;
        metrics::record_event_published(event.action.as_str());
        Ok(())
    }

    /// Register `callback` for every URL in `urls`.
    pub fn subscribe<I, F>(&self, urls: I, callback: F) -> Subscription
    where
        I: IntoIterator<Item = String>,
        F: Fn(&ResourceEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.registry.subscribe(urls.into_iter().collect(), Arc::new(callback))
    }

    /// Stop the dispatcher and wait for it to exit.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Change topic dispatcher ended abnormally");
            }
        }
    }
}

impl Drop for ChangeTopic {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn run_dispatcher(
    bus: Arc<dyn EventBus>,
    registry: Arc<Registry>,
    first: futures::stream::BoxStream<'static, Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reconnect = RetryConfig::daemon();
    let mut delay = reconnect.initial_delay;
    let mut stream = Some(first);

    loop {
        let Some(mut events) = stream.take() else {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
            match bus.listen().await {
                Ok(s) => {
                    info!("Change topic resubscribed");
                    delay = reconnect.initial_delay;
                    stream = Some(s);
                }
                Err(e) => {
                    warn!(error = %e, next_delay = ?delay, "Change topic resubscribe failed");
                    delay = reconnect.next_delay(delay);
                }
            }
            continue;
        };

        loop {
            tokio::select! {
                payload = events.next() => match payload {
                    Some(payload) => dispatch_payload(&registry, &payload),
                    None => {
                        warn!("Change topic stream ended, resubscribing");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    debug!("Change topic dispatcher stopping");
                    return;
                }
            }
        }
    }
}

fn dispatch_payload(registry: &Registry, payload: &[u8]) {
    match serde_json::from_slice::<ResourceEvent>(payload) {
        Ok(event) => {
            let delivered = registry.dispatch(&event);
            debug!(url = %event.url, action = event.action.as_str(), delivered, "Event dispatched");
        }
        Err(e) => warn!(error = %e, "Dropping malformed resource event"),
    }
}
