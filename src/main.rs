//! End-to-end walkthrough of the engine against the in-memory backend:
//! load, mutate, save, then lose a version race on purpose.

use anyhow::Result;
use recordsync::{
    EventKind, GzipCompressor, MemoryBackend, SaveOutcome, SyncConfig, SyncEngine, SyncRuntime,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());

    let engine = Arc::new(
        SyncEngine::new(
            backend.clone(),
            SyncConfig::new()
                .lease_ttl(Duration::from_secs(5))
                .autosave_interval(Duration::from_secs(2)),
        )?
        .with_defaults(json!({"Coins": 0, "Inventory": {}}))
        .with_compressor(Arc::new(GzipCompressor::new())),
    );

    engine.subscribe(
        EventKind::Saved,
        Arc::new(|event| println!("event: {:?}", event)),
    )?;
    engine.subscribe(
        EventKind::Conflict,
        Arc::new(|event| println!("event: {:?}", event)),
    )?;

    let runtime = SyncRuntime::start(engine.clone());

    // A client connects, earns some coins, and disconnects.
    let record = runtime.client_connected("player:1").await?;
    println!("loaded: {}", record);

    engine.set("player:1", Some("Coins"), json!(100)).await?;
    engine
        .set("player:1", Some("Inventory.Sword"), json!(true))
        .await?;
    runtime.client_disconnected("player:1").await?;

    println!("stored blob: {:?}", backend.peek("player:1").await);

    // Reconnect, then simulate another process racing ahead of us.
    runtime.client_connected("player:1").await?;
    engine.set("player:1", Some("Coins"), json!(250)).await?;

    backend
        .insert_raw("player:1", json!({"Coins": 999, "version": 50}))
        .await;

    match engine.save("player:1", false).await? {
        SaveOutcome::Conflict { stored } => {
            println!("conflict, backend kept: {}", stored);
        }
        other => println!("unexpected outcome: {:?}", other),
    }

    runtime.shutdown().await?;
    Ok(())
}
