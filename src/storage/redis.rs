//! Redis backends for the fast tier and the sync queue.
//!
//! Each resource record is one Redis hash:
//! ```text
//! HSET {prefix}files:bucket/files/a.txt body <bytes> etag <hex> synced false exists true ...
//! ```
//! The sync queue is a sorted set scored by due time (epoch millis):
//! ```text
//! ZADD {prefix}resource:queue 1767084657058 files:bucket/files/a.txt
//! ZRANGEBYSCORE {prefix}resource:queue -inf <now> LIMIT 0 <batch>
//! ```
//!
//! Both share one `ConnectionManager` and apply the same key prefix.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client};

use super::traits::{FastTier, FieldMap, ScoredSet, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Open a `ConnectionManager` with startup retries.
pub async fn connect(connection_string: &str) -> Result<ConnectionManager, StorageError> {
    let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

    // Fail fast when the URL is wrong, don't hang forever
    retry("redis_connect", &RetryConfig::startup(), || async {
        ConnectionManager::new(client.clone()).await
    })
    .await
    .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}{}", prefix, key)
    }
}

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisFastTier {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "dial:" → "dial:files:...")
    prefix: String,
}

impl RedisFastTier {
    pub fn new(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self { connection, prefix: prefix.unwrap_or("").to_string() }
    }

    /// Connect with startup retries.
    pub async fn open(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        Ok(Self::new(connect(connection_string).await?, prefix))
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl FastTier for RedisFastTier {
    async fn get_fields(&self, key: &str, fields: &[&str]) -> Result<FieldMap, StorageError> {
        if fields.is_empty() {
            return Ok(FieldMap::new());
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        let values: Vec<Option<Vec<u8>>> = retry("redis_hmget", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                cmd("HMGET")
                    .arg(&key)
                    .arg(fields)
                    .query_async::<Vec<Option<Vec<u8>>>>(&mut conn)
                    .await
            }
        })
        .await
        .map_err(backend)?;

        Ok(fields
            .iter()
            .zip(values)
            .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
            .collect())
    }

    async fn replace_fields(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        expiration: Option<Duration>,
    ) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_replace_fields", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let fields = fields.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.atomic().cmd("DEL").arg(&key).ignore();
                if !fields.is_empty() {
                    let mut hset = cmd("HSET");
                    hset.arg(&key);
                    for (name, value) in &fields {
                        hset.arg(name).arg(value.as_slice());
                    }
                    pipeline.add_command(hset).ignore();
                    if let Some(ttl) = expiration {
                        pipeline.cmd("PEXPIRE").arg(&key).arg(ttl.as_millis() as u64).ignore();
                    }
                }
                pipeline.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(backend)
    }

    async fn update_fields(&self, key: &str, fields: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_update_fields", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let fields = fields.clone();
            async move {
                let mut hset = cmd("HSET");
                hset.arg(&key);
                for (name, value) in &fields {
                    hset.arg(name).arg(value.as_slice());
                }
                hset.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(backend)
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let millis = ttl.as_millis() as u64;

        retry("redis_pexpire", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { cmd("PEXPIRE").arg(&key).arg(millis).query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }

    async fn clear_expiration(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_persist", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { cmd("PERSIST").arg(&key).query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }

    async fn expiration(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        let pttl: i64 = retry("redis_pttl", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { cmd("PTTL").arg(&key).query_async::<i64>(&mut conn).await }
        })
        .await
        .map_err(backend)?;

        // -1: no expiration, -2: no such key
        Ok(if pttl >= 0 { Some(Duration::from_millis(pttl as u64)) } else { None })
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_del", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { cmd("DEL").arg(&key).query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }
}

pub struct RedisScoredSet {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisScoredSet {
    pub fn new(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self { connection, prefix: prefix.unwrap_or("").to_string() }
    }
}

#[async_trait]
impl ScoredSet for RedisScoredSet {
    async fn add(&self, set: &str, member: &str, score: i64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let set = prefixed(&self.prefix, set);

        retry("redis_zadd", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set = set.clone();
            async move { cmd("ZADD").arg(&set).arg(score).arg(member).query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }

    async fn range_up_to(&self, set: &str, max_score: i64, limit: usize) -> Result<Vec<String>, StorageError> {
        let conn = self.connection.clone();
        let set = prefixed(&self.prefix, set);

        retry("redis_zrangebyscore", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set = set.clone();
            async move {
                cmd("ZRANGEBYSCORE")
                    .arg(&set)
                    .arg("-inf")
                    .arg(max_score)
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit)
                    .query_async::<Vec<String>>(&mut conn)
                    .await
            }
        })
        .await
        .map_err(backend)
    }

    async fn remove(&self, set: &str, member: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let set = prefixed(&self.prefix, set);

        retry("redis_zrem", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set = set.clone();
            async move { cmd("ZREM").arg(&set).arg(member).query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }

    async fn score(&self, set: &str, member: &str) -> Result<Option<i64>, StorageError> {
        let conn = self.connection.clone();
        let set = prefixed(&self.prefix, set);

        let score: Option<f64> = retry("redis_zscore", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set = set.clone();
            async move { cmd("ZSCORE").arg(&set).arg(member).query_async::<Option<f64>>(&mut conn).await }
        })
        .await
        .map_err(backend)?;

        Ok(score.map(|s| s as i64))
    }

    async fn len(&self, set: &str) -> Result<usize, StorageError> {
        let conn = self.connection.clone();
        let set = prefixed(&self.prefix, set);

        retry("redis_zcard", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let set = set.clone();
            async move { cmd("ZCARD").arg(&set).query_async::<usize>(&mut conn).await }
        })
        .await
        .map_err(backend)
    }
}
