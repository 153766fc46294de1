//! The persistence engine: load and save pipelines.
//!
//! Load: acquire lease → fetch with bounded retry → decompress → merge
//! defaults → increment version → migrate → advisory validate → register
//! session → `loaded` notification.
//!
//! Save: per-session save gate → snapshot record + take dirty set → no-op
//! short-circuit → conditional update with optimistic baseline check and
//! delta merge → compress → commit (backup ring, dirty clear, metadata) →
//! `saved`/`conflict` notification → optional lease release.

use crate::backend::{KvBackend, get_with_retry, update_with_retry};
use crate::config::SyncConfig;
use crate::core::value::{
    CREATED_AT_FIELD, SCHEMA_VERSION_FIELD, get_path, merge_defaults, record_version,
    schema_version, set_path, set_record_version, set_schema_version,
};
use crate::core::{Result, SyncError};
use crate::events::{EventHub, EventKind, EventListener, SyncEvent};
use crate::lease::LeaseManager;
use crate::migration::{Migration, MigrationRegistry};
use crate::schema::Schema;
use crate::session::{SaveSnapshot, Session, SessionMeta, SessionStore, SetValidator};
use chrono::Utc;
use log::{error, info, warn};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

pub mod compress;

pub use compress::{Compressor, GzipCompressor};

/// Structured result of a save attempt.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// The conditional update committed at this version.
    Saved { version: i64 },
    /// Nothing was dirty; metadata refreshed, backend untouched.
    NoChanges,
    /// A newer write already landed; the local snapshot was discarded and
    /// a `conflict` notification fired. The backend value is authoritative
    /// until a fresh load.
    Conflict { stored: Value },
    /// Transient backend failures exhausted the retry budget. The dirty
    /// set was requeued so the next save retries the same changes.
    Deferred { attempts: u32 },
}

enum CommitResult {
    Written { value: Value, version: i64 },
    Conflict { stored: Value },
}

/// Session-oriented synchronization engine over a [`KvBackend`].
///
/// One engine instance represents one process identity. Sessions are opened
/// with [`SyncEngine::load`], mutated through [`SyncEngine::set`] (which
/// only marks paths dirty) and persisted with [`SyncEngine::save`].
pub struct SyncEngine {
    backend: Arc<dyn KvBackend>,
    lease: LeaseManager,
    store: SessionStore,
    migrations: MigrationRegistry,
    schema: Option<Schema>,
    compressor: Option<Arc<dyn Compressor>>,
    events: EventHub,
    defaults: Value,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn KvBackend>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let owner = Uuid::new_v4().to_string();
        let lease = LeaseManager::new(
            backend.clone(),
            owner,
            config.lease_ttl,
            config.retry.clone(),
        );
        Ok(Self {
            backend,
            lease,
            store: SessionStore::new(),
            migrations: MigrationRegistry::new(),
            schema: None,
            compressor: None,
            events: EventHub::new(),
            defaults: Value::Object(Map::new()),
            config,
        })
    }

    /// Default shape merged into every loaded record (missing fields only).
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    /// Declared shape used to validate records: advisory on load, blocking
    /// on explicit `set` calls.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Compress blobs before writing, tagging them so future reads
    /// recognize the wrapper.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// This process's lease owner identity.
    pub fn owner(&self) -> &str {
        self.lease.owner()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self, kind: EventKind, listener: EventListener) -> Result<()> {
        self.events.subscribe(kind, listener)
    }

    pub fn register_migration<M>(&self, version: i64, migration: M) -> Result<()>
    where
        M: Migration + 'static,
    {
        self.migrations.register(version, Arc::new(migration))
    }

    pub fn register_validator<V>(&self, key: &str, validator: V) -> Result<()>
    where
        V: SetValidator + 'static,
    {
        self.store.register_validator(key, Arc::new(validator))
    }

    /// Keys of all currently active sessions.
    pub async fn active_keys(&self) -> Vec<String> {
        self.store.keys().await
    }

    pub async fn is_active(&self, key: &str) -> bool {
        self.store.contains(key).await
    }

    /// Open a session for `key`.
    ///
    /// Fails with [`SyncError::LeaseHeld`] (after a `rejected`
    /// notification) when another live process owns the record — the
    /// caller is expected to terminate the client connection. Returns a
    /// defensive copy of the loaded record.
    pub async fn load(&self, key: &str) -> Result<Value> {
        if self.store.contains(key).await {
            return Err(SyncError::SessionExists(key.to_string()));
        }

        if !self.lease.acquire(key).await? {
            self.events.emit(&SyncEvent::Rejected {
                key: key.to_string(),
                reason: "lease held by another process".to_string(),
            });
            return Err(SyncError::LeaseHeld(key.to_string()));
        }

        let blob = match get_with_retry(self.backend.as_ref(), key, &self.config.retry).await {
            Ok(blob) => blob,
            Err(err) => {
                // Fetch failed for good; don't leak the lease we just took.
                let _ = self.lease.release(key).await;
                return Err(err);
            }
        };

        let mut fresh = blob.is_none();
        let mut record = match blob {
            Some(blob) => compress::unwrap(blob, self.compressor.as_deref()),
            None => self.defaults.clone(),
        };
        if !record.is_object() {
            warn!("blob for '{}' is not an object; starting from defaults", key);
            record = self.defaults.clone();
            fresh = true;
        }

        merge_defaults(&mut record, &self.defaults);

        let baseline = record_version(&record);
        set_record_version(&mut record, baseline + 1);
        if fresh {
            if let Some(map) = record.as_object_mut() {
                map.entry(CREATED_AT_FIELD.to_string())
                    .or_insert_with(|| json!(Utc::now().to_rfc3339()));
            }
        }

        let report = self.migrations.apply(&mut record)?;
        if !report.is_clean() {
            warn!(
                "{} migration(s) skipped while loading '{}'",
                report.skipped.len(),
                key
            );
        }

        if let Some(schema) = &self.schema {
            // Advisory on load: log and proceed.
            if let Err(err) = schema.validate(&record) {
                warn!("loaded record '{}' failed validation: {}", key, err);
            }
        }

        let session = Session::new(key, record.clone(), baseline, self.config.backup_capacity);
        // A concurrent load of the same key lost the race here; its session
        // already holds the lease, so no cleanup beyond the error.
        self.store.insert(session).await?;

        event!(Level::DEBUG, key = %key, baseline, "session loaded");
        self.events.emit(&SyncEvent::Loaded {
            key: key.to_string(),
            record: record.clone(),
        });
        Ok(record)
    }

    /// Read the record (or one nested value) of an active session.
    pub async fn get(&self, key: &str, path: Option<&str>) -> Result<Value> {
        let slot = self
            .store
            .slot(key)
            .await
            .ok_or_else(|| SyncError::SessionNotFound(key.to_string()))?;
        let mut session = slot.state.lock().await;
        session.get(path)
    }

    /// Mutate the record of an active session.
    ///
    /// With a path, writes one nested value (creating intermediate
    /// containers) and marks only that path dirty; without one, replaces
    /// the whole record. Registered validators and the schema may reject
    /// the mutation, leaving the record unchanged.
    pub async fn set(&self, key: &str, path: Option<&str>, value: Value) -> Result<()> {
        let slot = self
            .store
            .slot(key)
            .await
            .ok_or_else(|| SyncError::SessionNotFound(key.to_string()))?;

        self.store.validate_set(key, path, &value)?;

        let mut session = slot.state.lock().await;
        if let Some(schema) = &self.schema {
            // Blocking on explicit writes: trial-apply on a copy first.
            let candidate = match path {
                None => value.clone(),
                Some(path) => {
                    let mut candidate = session.record().clone();
                    set_path(&mut candidate, path, value.clone())?;
                    candidate
                }
            };
            schema.validate(&candidate)?;
        }
        session.set(path, value)
    }

    /// Serialize the session's record to a JSON string.
    pub async fn export_json(&self, key: &str) -> Result<String> {
        let record = self.get(key, None).await?;
        Ok(serde_json::to_string(&record)?)
    }

    /// Replace the session's record with a JSON string (marks the whole
    /// record dirty). Validators and schema apply as for any replace.
    pub async fn import_json(&self, key: &str, payload: &str) -> Result<()> {
        let record: Value = serde_json::from_str(payload)?;
        if !record.is_object() {
            return Err(SyncError::Validation(
                "imported payload must be a JSON object".to_string(),
            ));
        }
        self.set(key, None, record).await
    }

    /// Prior saved snapshots of the session, oldest first.
    pub async fn backups(&self, key: &str) -> Result<Vec<Value>> {
        let slot = self
            .store
            .slot(key)
            .await
            .ok_or_else(|| SyncError::SessionNotFound(key.to_string()))?;
        let session = slot.state.lock().await;
        Ok(session.backups())
    }

    pub async fn session_meta(&self, key: &str) -> Result<SessionMeta> {
        let slot = self
            .store
            .slot(key)
            .await
            .ok_or_else(|| SyncError::SessionNotFound(key.to_string()))?;
        let session = slot.state.lock().await;
        Ok(session.meta().clone())
    }

    /// Persist the session's dirty paths as a delta against whatever the
    /// backend currently holds, optimistically checked against the
    /// session's baseline version. With `release`, the session is removed
    /// and the lease released regardless of the save outcome.
    pub async fn save(&self, key: &str, release: bool) -> Result<SaveOutcome> {
        let slot = self
            .store
            .slot(key)
            .await
            .ok_or_else(|| SyncError::SessionNotFound(key.to_string()))?;

        // Serializes saves per session: a save fully completes (dirty set
        // cleared or requeued) before the next one snapshots it.
        let gate = slot.save_gate.lock().await;

        let snapshot = {
            let mut session = slot.state.lock().await;
            session.begin_save()
        };

        let outcome = if snapshot.dirty.is_empty() && !self.config.force_noop_writes {
            {
                let mut session = slot.state.lock().await;
                session.mark_saved_noop();
            }
            self.events.emit(&SyncEvent::Saved {
                key: key.to_string(),
                record: snapshot.record,
            });
            SaveOutcome::NoChanges
        } else {
            match self.commit(key, &snapshot).await {
                Ok(CommitResult::Written { value, version }) => {
                    {
                        let mut session = slot.state.lock().await;
                        session.commit_save(value.clone(), version);
                    }
                    event!(Level::DEBUG, key = %key, version, "record saved");
                    self.events.emit(&SyncEvent::Saved {
                        key: key.to_string(),
                        record: value,
                    });
                    SaveOutcome::Saved { version }
                }
                Ok(CommitResult::Conflict { stored }) => {
                    // The local snapshot is discarded; the dirty paths it
                    // carried are not requeued. The backend value is
                    // authoritative until a fresh load.
                    warn!(
                        "save conflict on '{}': stored version {} is newer than baseline {}",
                        key,
                        record_version(&stored),
                        snapshot.baseline
                    );
                    self.events.emit(&SyncEvent::Conflict {
                        key: key.to_string(),
                        stored: stored.clone(),
                        attempted: snapshot.record,
                    });
                    SaveOutcome::Conflict { stored }
                }
                Err(err) => {
                    error!("save '{}' exhausted retries: {}", key, err);
                    let mut session = slot.state.lock().await;
                    session.requeue_dirty(snapshot.dirty);
                    SaveOutcome::Deferred {
                        attempts: self.config.retry.max_attempts,
                    }
                }
            }
        };

        drop(gate);
        if release {
            self.release_session(key).await;
        }
        Ok(outcome)
    }

    /// Force-save and release every active session. Used by the shutdown
    /// flush and tolerant of sessions released concurrently.
    pub async fn flush_all(&self) {
        let keys = self.store.keys().await;
        let results =
            futures::future::join_all(keys.iter().map(|key| self.save(key, true))).await;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(_) | Err(SyncError::SessionNotFound(_)) => {}
                Err(err) => warn!("shutdown flush for '{}': {}", key, err),
            }
        }
    }

    /// One autosave pass over all active sessions. Sessions released
    /// mid-pass are skipped, never an error.
    pub async fn autosave_pass(&self) {
        for key in self.store.keys().await {
            match self.save(&key, false).await {
                Ok(_) | Err(SyncError::SessionNotFound(_)) => {}
                Err(err) => warn!("autosave for '{}': {}", key, err),
            }
        }
    }

    /// One lease-renewal and timeout sweep. Renews the lease of every
    /// healthy session and force-saves-and-releases sessions whose
    /// heartbeat is older than the configured session timeout.
    pub async fn sweep_pass(&self) {
        let now = Utc::now();
        let timeout_ms = self.config.session_timeout.as_millis() as i64;

        for key in self.store.keys().await {
            let Some(slot) = self.store.slot(&key).await else {
                continue;
            };
            let idle_ms = {
                let session = slot.state.lock().await;
                now.signed_duration_since(session.meta().last_heartbeat_at)
                    .num_milliseconds()
            };

            if idle_ms > timeout_ms {
                info!(
                    "session '{}' inactive for {}ms; saving and releasing",
                    key, idle_ms
                );
                match self.save(&key, true).await {
                    Ok(_) | Err(SyncError::SessionNotFound(_)) => {}
                    Err(err) => warn!("timeout eviction for '{}': {}", key, err),
                }
                continue;
            }

            match self.lease.acquire(&key).await {
                Ok(true) => {}
                Ok(false) => warn!("lease for '{}' lost to another owner", key),
                Err(err) => warn!("lease renewal for '{}': {}", key, err),
            }
        }
    }

    async fn release_session(&self, key: &str) {
        self.store.remove(key).await;
        if let Err(err) = self.lease.release(key).await {
            warn!("lease release for '{}': {}", key, err);
        }
    }

    /// Conditional update against the backend. The callback re-reads the
    /// stored blob on every retry, so the optimistic check and the delta
    /// merge always run against the backend's current state.
    async fn commit(&self, key: &str, snapshot: &SaveSnapshot) -> Result<CommitResult> {
        let attempted_version = snapshot.baseline + 1;
        let mut conflict: Option<Value> = None;
        let mut written: Option<Value> = None;

        update_with_retry(
            self.backend.as_ref(),
            key,
            &mut |current| {
                conflict = None;
                written = None;

                let stored = current
                    .cloned()
                    .map(|blob| compress::unwrap(blob, self.compressor.as_deref()));
                let stored_version = stored.as_ref().map(record_version).unwrap_or(0);

                if stored_version > snapshot.baseline {
                    conflict = stored;
                    return None;
                }

                let mut next = match (&stored, snapshot.dirty.is_replace_all()) {
                    (None, _) | (_, true) => snapshot.record.clone(),
                    (Some(stored), false) => {
                        let mut base = stored.clone();
                        // Fields only present locally (newly introduced
                        // defaults) are filled in; everything else the
                        // backend holds is preserved verbatim.
                        merge_defaults(&mut base, &snapshot.record);
                        for path in snapshot.dirty.paths() {
                            if let Some(value) = get_path(&snapshot.record, path) {
                                let _ = set_path(&mut base, path, value.clone());
                            }
                        }
                        base
                    }
                };

                set_record_version(&mut next, attempted_version);
                if snapshot.record.get(SCHEMA_VERSION_FIELD).is_some() {
                    set_schema_version(&mut next, schema_version(&snapshot.record));
                }
                written = Some(next.clone());

                match &self.compressor {
                    Some(compressor) => match compress::wrap(&next, compressor.as_ref()) {
                        Ok(blob) => Some(blob),
                        Err(err) => {
                            warn!("compression for '{}' failed, storing raw: {}", key, err);
                            Some(next)
                        }
                    },
                    None => Some(next),
                }
            },
            None,
            &self.config.retry,
        )
        .await?;

        match (conflict, written) {
            (Some(stored), _) => Ok(CommitResult::Conflict { stored }),
            (None, Some(value)) => Ok(CommitResult::Written {
                value,
                version: attempted_version,
            }),
            (None, None) => Err(SyncError::Backend(format!(
                "conditional update for '{}' produced no outcome",
                key
            ))),
        }
    }
}
