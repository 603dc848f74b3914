//! Distributed locks shared by every replica that uses the same Redis.
//!
//! - `SET {prefix}lock:{key} <uuid> NX PX <ttl>` to acquire
//! - a Lua compare-and-delete to release only a lock we still own
//! - a keepalive task extends the lease every third of the TTL while held
//! - the TTL frees locks whose holder died without releasing

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Script};
use tracing::{debug, error, warn};

use super::{LockError, LockGuard, LockService};
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};

/// Poll interval while waiting for a held lock.
const LOCK_RETRY_DELAY_MS: u64 = 50;

/// Only release if we own it.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Only extend if we still own it.
const RENEW_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLockService {
    connection: ConnectionManager,
    prefix: String,
    lock_ttl: Duration,
}

impl RedisLockService {
    pub fn new(connection: ConnectionManager, prefix: Option<&str>, lock_ttl: Duration) -> Self {
        Self { connection, prefix: prefix.unwrap_or("").to_string(), lock_ttl }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}lock:{}", self.prefix, key)
    }

    /// One `SET NX PX` attempt. Returns the owner token on success.
    async fn try_acquire_once(&self, lock_key: &str) -> Result<Option<String>, LockError> {
        let lock_id = uuid::Uuid::new_v4().to_string();
        let ttl_ms = self.lock_ttl.as_millis() as u64;
        let conn = self.connection.clone();

        let result: Option<String> = retry("redis_lock_acquire", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let lock_id = lock_id.clone();
            async move {
                cmd("SET")
                    .arg(lock_key)
                    .arg(&lock_id)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<Option<String>>(&mut conn)
                    .await
            }
        })
        .await
        .map_err(|e: redis::RedisError| LockError::Backend(format!("Failed to acquire lock: {}", e)))?;

        Ok(result.map(|_| lock_id))
    }

    /// Extend the lease every third of the TTL until aborted or the lock
    /// is found taken over.
    fn spawn_keepalive(&self, lock_key: String, lock_id: String) -> Option<tokio::task::JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let ttl_ms = self.lock_ttl.as_millis() as u64;
        let period = (self.lock_ttl / 3).max(Duration::from_millis(10));
        let conn = self.connection.clone();

        Some(handle.spawn(async move {
            let mut conn = conn;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let renewed: Result<i32, _> = Script::new(RENEW_LOCK_SCRIPT)
                    .key(&lock_key)
                    .arg(&lock_id)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await;
                match renewed {
                    Ok(1) => debug!(lock = %lock_key, "Lock lease renewed"),
                    Ok(_) => {
                        error!(lock = %lock_key, "Lock lease lost while held");
                        metrics::record_lock_lost("renew");
                        return;
                    }
                    Err(e) => warn!(lock = %lock_key, error = %e, "Failed to renew lock"),
                }
            }
        }))
    }

    /// Drop cannot be async, so the release runs on a spawned task.
    fn guard(&self, key: &str, lock_key: String, lock_id: String) -> LockGuard {
        let conn = self.connection.clone();
        let keepalive = self.spawn_keepalive(lock_key.clone(), lock_id.clone());
        LockGuard::with_release_fn(key.to_string(), move || {
            if let Some(keepalive) = keepalive {
                keepalive.abort();
            }
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(lock = %lock_key, "No runtime to release lock, leaving it to expire");
                return;
            };
            handle.spawn(async move {
                let mut conn = conn;
                let released: Result<i32, _> = Script::new(RELEASE_LOCK_SCRIPT)
                    .key(&lock_key)
                    .arg(&lock_id)
                    .invoke_async(&mut conn)
                    .await;
                match released {
                    Ok(1) => debug!(lock = %lock_key, "Lock released"),
                    Ok(_) => {
                        error!(lock = %lock_key, "Lock expired before release");
                        metrics::record_lock_lost("release");
                    }
                    Err(e) => warn!(lock = %lock_key, error = %e, "Failed to release lock"),
                }
            });
        })
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn lock(&self, key: &str) -> Result<LockGuard, LockError> {
        let lock_key = self.lock_key(key);
        let retry_delay = Duration::from_millis(LOCK_RETRY_DELAY_MS);

        loop {
            if let Some(lock_id) = self.try_acquire_once(&lock_key).await? {
                return Ok(self.guard(key, lock_key, lock_id));
            }
            tokio::time::sleep(retry_delay).await;
        }
    }

    async fn try_lock(&self, key: &str) -> Result<Option<LockGuard>, LockError> {
        let lock_key = self.lock_key(key);
        Ok(self
            .try_acquire_once(&lock_key)
            .await?
            .map(|lock_id| self.guard(key, lock_key, lock_id)))
    }
}
