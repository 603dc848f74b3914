// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic resource-engine usage example.
//!
//! Demonstrates:
//! 1. Building an engine (Redis + SQLite when `REDIS_URL` is set, memory otherwise)
//! 2. Writing and reading resources with etag preconditions
//! 3. Read-modify-write with `compute_resource`
//! 4. Subscribing to change events
//! 5. Folder listings and write-back through the sync worker
//! 6. Displaying captured metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use resource_engine::{
    EtagPrecondition, FolderEntry, ResourceDescriptor, ResourceEngine, ResourceEngineConfig,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          resource-engine: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let db_dir = tempfile::tempdir()?;
    let config = ResourceEngineConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: Some("demo:".into()),
        sql_url: Some(format!("sqlite://{}?mode=rwc", db_dir.path().join("demo.db").display())),
        sync_period_ms: 200,
        sync_delay_ms: 0,
        ..Default::default()
    };
    let engine = Arc::new(ResourceEngine::connect(config).await?);
    let worker = engine.start_sync_worker();
    println!("✅ Engine ready (sync worker running: {})\n", worker.is_running());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Subscribe, then write and read with preconditions
    // ─────────────────────────────────────────────────────────────────────────
    let chat = ResourceDescriptor::from_url("conversations/demo/chats/hello.json")?;
    let _subscription = engine.subscribe_resources(std::slice::from_ref(&chat), |event| {
        println!("   📣 {} {} (etag {:?})", event.action.as_str(), event.url, event.etag);
        Ok(())
    });

    let created = engine
        .put_resource(&chat, br#"{"messages":[]}"#.to_vec(), &EtagPrecondition::create_only())
        .await?;
    println!("📝 Created {} etag={}", created.url(), &created.etag[..12]);

    let updated = engine
        .put_resource(
            &chat,
            br#"{"messages":["hi"]}"#.to_vec(),
            &EtagPrecondition::if_match(created.etag.clone()),
        )
        .await?;
    println!("📝 Updated with If-Match, etag={}", &updated.etag[..12]);

    match engine
        .put_resource(&chat, b"{}".to_vec(), &EtagPrecondition::if_match(created.etag))
        .await
    {
        Err(e) if e.is_conflict() => println!("🛑 Stale etag rejected: {}", e),
        other => println!("⚠️  Unexpected result: {:?}", other.map(|m| m.etag)),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Serialized read-modify-write
    // ─────────────────────────────────────────────────────────────────────────
    let counter = ResourceDescriptor::from_url("limits/demo/requests")?;
    let tasks = (0..10).map(|_| {
        let engine = engine.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            engine
                .compute_resource(&counter, &EtagPrecondition::Any, |old| {
                    let n: u64 = old.and_then(|b| std::str::from_utf8(b).ok()?.parse().ok()).unwrap_or(0);
                    Ok(Some((n + 1).to_string().into_bytes()))
                })
                .await
        })
    });
    for task in futures::future::join_all(tasks).await {
        task??;
    }
    let value = engine.get_resource(&counter).await?.unwrap_or_default();
    println!("🔢 Counter after 10 concurrent increments: {}", String::from_utf8_lossy(&value));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Listings and write-back
    // ─────────────────────────────────────────────────────────────────────────
    for name in ["a.json", "b.json", "nested/c.json"] {
        let desc = ResourceDescriptor::from_url(&format!("prompts/demo/library/{}", name))?;
        engine.put_resource(&desc, b"{}".to_vec(), &EtagPrecondition::Any).await?;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let folder = ResourceDescriptor::from_url("prompts/demo/library/")?;
    if let Some(listing) = engine.get_folder_metadata(&folder, None, 100, false).await? {
        println!("\n📂 {}", listing.descriptor);
        for entry in &listing.entries {
            match entry {
                FolderEntry::Folder(desc) => println!("   📁 {}", desc.name()),
                FolderEntry::Item(item) => println!(
                    "   📄 {} ({} bytes, synced: {})",
                    item.descriptor.name(),
                    item.content_length,
                    item.etag.is_some()
                ),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    let report = engine.shutdown().await?;
    println!("\n👋 Shutdown complete ({} keys flushed)", report.synced);
    Ok(())
}

/// Print captured counters, gauges and histogram summaries.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let labels = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{} = {}", labels, v),
            DebugValue::Gauge(v) => format!("{} = {:.2}", labels, v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                format!("{} count={} avg={:.6}s", labels, count, avg)
            }
        };
        lines.push(format!("{}{}", key.name(), rendered));
    }
    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
