//! Transports for resource events.
//!
//! [`LocalEventBus`] fans out inside one process; [`RedisEventBus`] reaches
//! every replica subscribed to the same channel.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{cmd, Client};
use tokio::sync::broadcast;
use tracing::warn;

use super::TopicError;
use crate::resilience::retry::{retry, RetryConfig};

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TopicError>;

    /// Subscribe and return every payload published from now on.
    ///
    /// The stream ends when the transport drops; callers resubscribe.
    async fn listen(&self) -> Result<BoxStream<'static, Vec<u8>>, TopicError>;
}

/// In-process broadcast channel.
pub struct LocalEventBus {
    sender: broadcast::Sender<Vec<u8>>,
}

impl LocalEventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TopicError> {
        // No listeners is not an error: nobody is subscribed yet
        let _ = self.sender.send(payload);
        Ok(())
    }

    async fn listen(&self) -> Result<BoxStream<'static, Vec<u8>>, TopicError> {
        let receiver = self.sender.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((payload, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Redis PUBLISH / SUBSCRIBE on one channel.
pub struct RedisEventBus {
    client: Client,
    connection: ConnectionManager,
    channel: String,
}

impl RedisEventBus {
    /// `channel` is used as given; apply any key prefix before calling.
    pub fn new(client: Client, connection: ConnectionManager, channel: String) -> Self {
        Self { client, connection, channel }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TopicError> {
        let conn = self.connection.clone();
        let channel = self.channel.clone();

        retry("redis_publish", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let channel = channel.clone();
            let payload = payload.clone();
            async move {
                cmd("PUBLISH")
                    .arg(&channel)
                    .arg(payload)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
        .map_err(|e: redis::RedisError| TopicError::Backend(e.to_string()))
    }

    async fn listen(&self) -> Result<BoxStream<'static, Vec<u8>>, TopicError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TopicError::Backend(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| TopicError::Backend(e.to_string()))?;

        let channel = self.channel.clone();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<Vec<u8>>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping unreadable event payload");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
