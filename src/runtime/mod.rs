//! Lifecycle scheduling: background loops and host signals.
//!
//! Two long-lived loops run alongside externally triggered load/save calls:
//! the autosave loop persists every active session on an interval, and the
//! sweep loop renews leases and evicts sessions whose heartbeat went stale.
//! Both communicate with the session table only through the engine's public
//! operations and stop when the runtime shuts down.

use crate::core::{Result, SyncError};
use crate::persist::{SaveOutcome, SyncEngine};
use log::{debug, warn};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct Worker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<F, Fut>(interval: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        tick().await;
                    }
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| SyncError::Backend(format!("worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Drives a [`SyncEngine`] on timers and host lifecycle signals.
pub struct SyncRuntime {
    engine: Arc<SyncEngine>,
    autosave: Option<Worker>,
    sweeper: Option<Worker>,
}

impl SyncRuntime {
    /// Spawn the autosave and sweep loops for `engine`.
    pub fn start(engine: Arc<SyncEngine>) -> Self {
        let autosave_interval = engine.config().autosave_interval;
        let sweep_interval = engine.config().effective_sweep_interval();

        let autosave_engine = engine.clone();
        let autosave = Worker::spawn(autosave_interval, move || {
            let engine = autosave_engine.clone();
            async move {
                engine.autosave_pass().await;
            }
        });

        let sweep_engine = engine.clone();
        let sweeper = Worker::spawn(sweep_interval, move || {
            let engine = sweep_engine.clone();
            async move {
                engine.sweep_pass().await;
            }
        });

        Self {
            engine,
            autosave: Some(autosave),
            sweeper: Some(sweeper),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Host signal: a client connected. Opens the session and returns a
    /// copy of its record; a lease rejection means the client must be
    /// disconnected.
    pub async fn client_connected(&self, key: &str) -> Result<Value> {
        self.engine.load(key).await
    }

    /// Host signal: a client disconnected. Saves and releases the session;
    /// an already-released session is not an error.
    pub async fn client_disconnected(&self, key: &str) -> Result<SaveOutcome> {
        match self.engine.save(key, true).await {
            Ok(outcome) => Ok(outcome),
            Err(SyncError::SessionNotFound(_)) => {
                debug!("client '{}' disconnected with no active session", key);
                Ok(SaveOutcome::NoChanges)
            }
            Err(err) => Err(err),
        }
    }

    /// Host signal: the process is shutting down. Stops both loops, then
    /// flushes (saves and releases) every remaining session.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(autosave) = self.autosave.take() {
            autosave.stop().await?;
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop().await?;
        }
        self.engine.flush_all().await;
        if !self.engine.active_keys().await.is_empty() {
            warn!("sessions remained active after shutdown flush");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::SyncConfig;
    use serde_json::json;

    fn fast_config() -> SyncConfig {
        SyncConfig::new()
            .lease_ttl(Duration::from_millis(200))
            .session_timeout(Duration::from_millis(150))
            .autosave_interval(Duration::from_millis(25))
            .sweep_interval(Duration::from_millis(25))
    }

    #[tokio::test]
    async fn test_autosave_loop_persists_dirty_sessions() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Arc::new(
            SyncEngine::new(backend.clone(), fast_config())
                .unwrap()
                .with_defaults(json!({"Coins": 0})),
        );
        let runtime = SyncRuntime::start(engine.clone());

        runtime.client_connected("player:1").await.unwrap();
        engine.set("player:1", Some("Coins"), json!(42)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let stored = backend.peek("player:1").await.unwrap();
        assert_eq!(stored["Coins"], json!(42));

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_evicts_inactive_sessions() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Arc::new(
            SyncEngine::new(backend.clone(), fast_config())
                .unwrap()
                .with_defaults(json!({"Coins": 0})),
        );
        let runtime = SyncRuntime::start(engine.clone());

        runtime.client_connected("player:1").await.unwrap();
        engine.set("player:1", Some("Coins"), json!(5)).await.unwrap();

        // No heartbeat past the session timeout: the sweep loop must save
        // and release on its own.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!engine.is_active("player:1").await);
        assert_eq!(backend.peek("player:1").await.unwrap()["Coins"], json!(5));
        assert_eq!(backend.peek("player:1::lease").await, None);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_active_sessions() {
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

        runtime.client_connected("player:1").await.unwrap();
        runtime.client_connected("player:2").await.unwrap();
        engine.set("player:1", Some("Coins"), json!(1)).await.unwrap();
        engine.set("player:2", Some("Coins"), json!(2)).await.unwrap();

        runtime.shutdown().await.unwrap();

        assert_eq!(backend.peek("player:1").await.unwrap()["Coins"], json!(1));
        assert_eq!(backend.peek("player:2").await.unwrap()["Coins"], json!(2));
        assert_eq!(backend.peek("player:1::lease").await, None);
        assert_eq!(backend.peek("player:2::lease").await, None);
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_a_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Arc::new(SyncEngine::new(backend, fast_config()).unwrap());
        let runtime = SyncRuntime::start(engine);

        let outcome = runtime.client_disconnected("ghost").await.unwrap();
        assert!(matches!(outcome, SaveOutcome::NoChanges));
        runtime.shutdown().await.unwrap();
    }
}
