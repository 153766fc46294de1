/// Lifecycle scheduler tests
///
/// Background autosave and sweep loops, heartbeat-driven eviction, retry
/// behavior under injected backend faults, and the shutdown flush.
/// Run with: cargo test --test lifecycle_tests
use recordsync::{
    MemoryBackend, RetryPolicy, SaveOutcome, SyncConfig, SyncEngine, SyncRuntime,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> SyncConfig {
    SyncConfig::new()
        .lease_ttl(Duration::from_millis(300))
        .session_timeout(Duration::from_millis(200))
        .autosave_interval(Duration::from_millis(30))
        .sweep_interval(Duration::from_millis(30))
        .retry(RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        })
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(
        SyncEngine::new(backend.clone(), fast_config())
            .unwrap()
            .with_defaults(json!({"Coins": 0})),
    );
    let runtime = SyncRuntime::start(engine.clone());

    runtime.client_connected("player:1").await.unwrap();

    // Keep reading well past the session timeout; every read touches the
    // heartbeat, so the sweep loop must not evict.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.get("player:1", None).await.unwrap();
    }
    assert!(engine.is_active("player:1").await);

    // Stop touching it and the sweep loop takes over.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!engine.is_active("player:1").await);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sweep_renews_lease_for_active_sessions() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(
        SyncEngine::new(
            backend.clone(),
            fast_config().session_timeout(Duration::from_secs(60)),
        )
        .unwrap()
        .with_defaults(json!({"Coins": 0})),
    );
    let runtime = SyncRuntime::start(engine.clone());

    runtime.client_connected("player:1").await.unwrap();
    let initial = backend.peek("player:1::lease").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let renewed = backend.peek("player:1::lease").await.unwrap();
    assert_eq!(renewed["owner"], initial["owner"]);
    assert!(renewed["timestamp"].as_i64().unwrap() > initial["timestamp"].as_i64().unwrap());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_autosave_retries_after_transient_faults() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(
        SyncEngine::new(backend.clone(), fast_config())
            .unwrap()
            .with_defaults(json!({"Coins": 0})),
    );
    let runtime = SyncRuntime::start(engine.clone());

    runtime.client_connected("player:1").await.unwrap();
    engine.set("player:1", Some("Coins"), json!(8)).await.unwrap();

    // Enough injected faults to exhaust one full save attempt; the dirty
    // set stays queued and a later autosave pass lands the write.
    backend.fail_next(4);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let stored = backend.peek("player:1").await.unwrap();
    assert_eq!(stored["Coins"], json!(8));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_explicit_save_failure_keeps_changes_for_next_attempt() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::new(
        backend.clone(),
        SyncConfig::new().retry(RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
        }),
    )
    .unwrap()
    .with_defaults(json!({"Coins": 0}));

    engine.load("player:1").await.unwrap();
    engine.set("player:1", Some("Coins"), json!(31)).await.unwrap();

    backend.fail_next(10);
    let outcome = engine.save("player:1", false).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Deferred { .. }));
    assert_eq!(backend.peek("player:1").await, None);

    // Faults drained; the same dirty paths go out now.
    backend.fail_next(0);
    let outcome = engine.save("player:1", false).await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Saved { version: 1 }));
    assert_eq!(backend.peek("player:1").await.unwrap()["Coins"], json!(31));
}

#[tokio::test]
async fn test_shutdown_releases_every_lease() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(
        SyncEngine::new(
            backend.clone(),
            SyncConfig::new()
                .autosave_interval(Duration::from_secs(3600))
                .sweep_interval(Duration::from_secs(3600)),
        )
        .unwrap()
        .with_defaults(json!({"Coins": 0})),
    );
    let runtime = SyncRuntime::start(engine.clone());

    for key in ["player:1", "player:2", "player:3"] {
        runtime.client_connected(key).await.unwrap();
        engine.set(key, Some("Coins"), json!(1)).await.unwrap();
    }

    runtime.shutdown().await.unwrap();

    for key in ["player:1", "player:2", "player:3"] {
        assert!(backend.peek(key).await.is_some(), "{} not flushed", key);
        assert_eq!(
            backend.peek(&format!("{}::lease", key)).await,
            None,
            "{} lease leaked",
            key
        );
    }
}

#[tokio::test]
async fn test_mutations_during_inflight_save_survive_to_next_cycle() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Arc::new(
        SyncEngine::new(backend.clone(), fast_config())
            .unwrap()
            .with_defaults(json!({"Coins": 0})),
    );

    engine.load("player:1").await.unwrap();
    engine.set("player:1", Some("Coins"), json!(1)).await.unwrap();

    // Run a save while concurrently mutating from another task. Whatever
    // lands during the in-flight save accumulates in a fresh dirty set.
    let saver = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.save("player:1", false).await.unwrap() })
    };
    engine.set("player:1", Some("Gems"), json!(2)).await.unwrap();
    saver.await.unwrap();

    engine.save("player:1", false).await.unwrap();
    let stored = backend.peek("player:1").await.unwrap();
    assert_eq!(stored["Coins"], json!(1));
    assert_eq!(stored["Gems"], json!(2));
}
