//! Write-back of dirty fast-tier records to the durable tier.
//!
//! The worker drains due keys from the sync queue on a fixed period. Each
//! key is reconciled under a non-blocking lock; keys held by a foreground
//! operation are left for the next tick.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::{self, LatencyTimer};
use crate::resource::{now_millis, ResourceDescriptor, ResourceKey, ResourceRecord};

use super::types::SyncReport;
use super::{descriptor_from_key, ResourceEngine, SYNC_QUEUE};

/// Controls the periodic sync task. Clones share the same task.
#[derive(Clone)]
pub struct SyncWorkerHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncWorkerHandle {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the task and wait for the current tick to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync worker ended abnormally");
            }
        }
    }
}

/// What one reconciliation did.
#[derive(Debug, PartialEq, Eq)]
enum Reconciled {
    Written,
    Normalized,
}

impl ResourceEngine {
    /// Run one tick over keys due now.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        self.sync_due(now_millis()).await
    }

    /// Write back `desc` now if dirty, then evict it from the fast tier.
    ///
    /// Returns whether anything was written to the durable tier.
    pub async fn flush(&self, desc: &ResourceDescriptor) -> Result<bool> {
        desc.require_item()?;
        let key = desc.key();
        let _guard = self.locks.lock(key.as_str()).await?;
        self.flush_locked(desc, &key).await
    }

    /// Spawn the periodic worker, or return the running one.
    ///
    /// The task holds a weak reference and exits once the engine is dropped.
    pub fn start_sync_worker(self: &Arc<Self>) -> SyncWorkerHandle {
        let mut slot = self.worker.lock();
        if let Some(handle) = slot.as_ref().filter(|h| h.is_running()) {
            return handle.clone();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let period = self.config.sync_period().max(Duration::from_millis(1));
        let task = tokio::spawn(run_worker(Arc::downgrade(self), period, stop_rx));
        info!(period_ms = period.as_millis() as u64, "Sync worker started");

        let handle = SyncWorkerHandle { stop_tx: Arc::new(stop_tx), task: Arc::new(Mutex::new(Some(task))) };
        *slot = Some(handle.clone());
        handle
    }

    /// Stop the worker, reconcile every queued key regardless of due time,
    /// and stop event dispatch.
    pub async fn shutdown(&self) -> Result<SyncReport> {
        info!("Shutting down resource engine...");
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }

        let report = self.drain_queue().await;
        self.topic.close().await;
        match &report {
            Ok(r) => info!(synced = r.synced, failed = r.failed, "Resource engine stopped"),
            Err(e) => error!(error = %e, "Final sync failed"),
        }
        report
    }

    /// Run passes over the whole queue until it is empty or a pass makes no
    /// progress. Skipped and failed counts come from the last pass.
    async fn drain_queue(&self) -> Result<SyncReport> {
        let mut total = SyncReport::default();
        loop {
            let pass = self.sync_due(i64::MAX).await?;
            total.synced += pass.synced;
            total.normalized += pass.normalized;
            total.skipped = pass.skipped;
            total.failed = pass.failed;
            if pass.due == 0 || pass.synced + pass.normalized == 0 {
                break;
            }
        }
        total.due = total.synced + total.normalized + total.skipped + total.failed;
        Ok(total)
    }

    async fn sync_due(&self, max_score: i64) -> Result<SyncReport> {
        let _timer = LatencyTimer::new("engine", "sync");
        let due = self.queue.range_up_to(SYNC_QUEUE, max_score, self.config.sync_batch).await?;
        let mut report = SyncReport { due: due.len(), ..SyncReport::default() };

        for member in due {
            let guard = match self.locks.try_lock(&member).await {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    debug!(key = %member, "Key busy, retrying next tick");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(key = %member, error = %e, "Lock failed during sync");
                    metrics::record_sync_failure("lock");
                    report.failed += 1;
                    continue;
                }
            };

            match self.reconcile(&member).await {
                Ok(Reconciled::Written) => report.synced += 1,
                Ok(Reconciled::Normalized) => report.normalized += 1,
                Err(e) => {
                    warn!(key = %member, error = %e, "Sync failed, key stays queued");
                    metrics::record_sync_failure("write");
                    report.failed += 1;
                }
            }
            drop(guard);
        }

        metrics::record_sync_batch(report.synced, report.skipped);
        if let Ok(depth) = self.queue.len(SYNC_QUEUE).await {
            metrics::set_sync_queue_depth(depth as u64);
        }
        if report.due > 0 {
            debug!(
                due = report.due,
                synced = report.synced,
                normalized = report.normalized,
                skipped = report.skipped,
                failed = report.failed,
                "Sync tick complete"
            );
        }
        Ok(report)
    }

    /// Reconcile one queued key. The caller holds its lock.
    async fn reconcile(&self, member: &str) -> Result<Reconciled> {
        let desc = match descriptor_from_key(member) {
            Ok(desc) => desc,
            Err(e) => {
                warn!(key = %member, error = %e, "Dropping unparseable queue entry");
                self.queue.remove(SYNC_QUEUE, member).await?;
                return Ok(Reconciled::Normalized);
            }
        };
        let key = desc.key();

        match self.read_record(&key, true).await? {
            ResourceRecord::Absent => {
                self.dequeue(&key).await?;
                Ok(Reconciled::Normalized)
            }
            record if record.is_synced() => {
                self.fast.set_expiration(key.as_str(), self.config.cache_expiration()).await?;
                self.dequeue(&key).await?;
                Ok(Reconciled::Normalized)
            }
            ResourceRecord::Present(mut present) => {
                let Some(body) = present.body.take() else {
                    return self.drop_bodiless(&key).await;
                };
                self.store_durable(&desc, &present, body).await?;
                self.mark_synced(&key).await?;
                self.dequeue(&key).await?;
                Ok(Reconciled::Written)
            }
            ResourceRecord::Tombstone { .. } => {
                self.durable.delete(&desc.blob_path()).await?;
                self.write_record(&key, &ResourceRecord::Tombstone { synced: true }).await?;
                self.dequeue(&key).await?;
                Ok(Reconciled::Written)
            }
        }
    }

    /// A dirty record without a body cannot be written back; forget it so
    /// the next read reloads the durable copy.
    async fn drop_bodiless(&self, key: &ResourceKey) -> Result<Reconciled> {
        warn!(key = %key, "Dirty record has no body, evicting it");
        metrics::record_corruption(key.as_str());
        self.fast.remove(key.as_str()).await?;
        self.dequeue(key).await?;
        Ok(Reconciled::Normalized)
    }

    /// Synchronous write-back plus eviction. The caller holds the lock.
    pub(super) async fn flush_locked(&self, desc: &ResourceDescriptor, key: &ResourceKey) -> Result<bool> {
        let written = match self.read_record(key, true).await? {
            ResourceRecord::Present(present) if !present.synced => match present.body.clone() {
                Some(body) => {
                    self.store_durable(desc, &present, body).await?;
                    true
                }
                None => false,
            },
            ResourceRecord::Tombstone { synced: false } => {
                self.durable.delete(&desc.blob_path()).await?;
                true
            }
            _ => false,
        };
        self.fast.remove(key.as_str()).await?;
        self.dequeue(key).await?;
        if written {
            debug!(url = %desc, "Flushed dirty record");
        }
        Ok(written)
    }
}

async fn run_worker(engine: Weak<ResourceEngine>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }
        let Some(engine) = engine.upgrade() else {
            break;
        };

        match AssertUnwindSafe(engine.sync_once()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Sync tick failed");
                metrics::record_sync_failure("tick");
            }
            Err(_) => {
                error!("Sync tick panicked, worker continues");
                metrics::record_sync_failure("panic");
            }
        }
    }
    info!("Sync worker stopped");
}
