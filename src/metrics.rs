// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the resource engine.
//!
//! Uses the `metrics` crate facade; the host process installs the exporter.
//!
//! # Metric Naming Convention
//! - `resource_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: fast, durable, engine
//! - `operation`: get, put, compute, delete, copy, list, sync
//! - `status`: success, error, conflict

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a completed operation
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "resource_engine_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "resource_engine_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Keys reconciled by one sync tick
pub fn record_sync_batch(synced: usize, skipped: usize) {
    histogram!("resource_engine_sync_batch_size").record(synced as f64);
    if skipped > 0 {
        counter!("resource_engine_sync_skipped_total").increment(skipped as u64);
    }
}

pub fn record_sync_failure(kind: &str) {
    counter!(
        "resource_engine_sync_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn set_sync_queue_depth(depth: u64) {
    gauge!("resource_engine_sync_queue_depth").set(depth as f64);
}

/// A held lock's lease ran out. `stage` is `renew` or `release`.
pub fn record_lock_lost(stage: &str) {
    counter!(
        "resource_engine_lock_lost_total",
        "stage" => stage.to_string()
    )
    .increment(1);
}

pub fn record_event_published(action: &str) {
    counter!(
        "resource_engine_events_published_total",
        "action" => action.to_string()
    )
    .increment(1);
}

pub fn record_event_publish_failure() {
    counter!("resource_engine_event_publish_failures_total").increment(1);
}

/// `outcome` is `error` or `panic`
pub fn record_subscriber_failure(outcome: &str) {
    counter!(
        "resource_engine_subscriber_failures_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// A fast-tier record that could not be decoded
pub fn record_corruption(key: &str) {
    counter!(
        "resource_engine_corruption_detected_total",
        "key" => key.to_string()
    )
    .increment(1);
}

/// Body bytes served from the durable tier without caching
pub fn record_uncached_read(bytes: u64) {
    counter!("resource_engine_uncached_read_bytes_total").increment(bytes);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self { tier, operation, start: Instant::now() }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
