// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential-backoff retries for backend calls.
//!
//! Every Redis and SQL call in the storage, lock and topic backends is
//! wrapped in [`retry`]. Presets pick the attempt budget:
//!
//! ```
//! use resource_engine::RetryConfig;
//!
//! // Connecting at startup: a few attempts, then surface the config error
//! assert_eq!(RetryConfig::startup().max_retries, Some(5));
//!
//! // Per-request backend calls: fail quickly back to the caller
//! assert_eq!(RetryConfig::query().max_retries, Some(3));
//!
//! // Long-running reconnect loops never give up
//! assert_eq!(RetryConfig::daemon().max_retries, None);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts before giving up; `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// 5 attempts, ~6 seconds in total. Used while connecting.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Retries forever, backoff capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// 3 quick attempts for a single backend call.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay that follows `delay` in this schedule.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0usize;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Backend call recovered");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_delay = ?delay,
                        "Backend call failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_delay = ?delay,
                        "Backend call failed, retrying until it succeeds"
                    ),
                }

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
