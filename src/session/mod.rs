//! In-memory table of active sessions.
//!
//! A session owns the live record for one connected client between load and
//! release. Mutations never touch the backend directly: they mark key paths
//! dirty and bump an edit counter; the persistence engine turns the dirty
//! set into a delta on the next save.

use crate::core::value::{get_path, set_path};
use crate::core::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{Mutex, RwLock};

/// Validates a mutation before it is applied to a session's record.
///
/// Registered per record key; a rejecting validator blocks that `set` and
/// leaves the record unchanged.
pub trait SetValidator: Send + Sync {
    fn validate(&self, key: &str, path: Option<&str>, value: &Value) -> Result<()>;
}

impl<F> SetValidator for F
where
    F: Fn(&str, Option<&str>, &Value) -> Result<()> + Send + Sync,
{
    fn validate(&self, key: &str, path: Option<&str>, value: &Value) -> Result<()> {
        self(key, path, value)
    }
}

/// Key paths touched since the last successful save.
#[derive(Debug, Clone, Default)]
pub struct DirtyState {
    replace_all: bool,
    paths: BTreeSet<String>,
}

impl DirtyState {
    pub fn mark_path(&mut self, path: &str) {
        if !self.replace_all {
            self.paths.insert(path.to_string());
        }
    }

    /// Mark the whole record replaced. Individual paths become redundant.
    pub fn mark_all(&mut self) {
        self.replace_all = true;
        self.paths.clear();
    }

    pub fn is_empty(&self) -> bool {
        !self.replace_all && self.paths.is_empty()
    }

    pub fn is_replace_all(&self) -> bool {
        self.replace_all
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Fold another dirty set back in (used when a save attempt fails and
    /// its changes must be retried together with newer ones).
    pub fn merge(&mut self, other: DirtyState) {
        if other.replace_all {
            self.mark_all();
        } else if !self.replace_all {
            self.paths.extend(other.paths);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub created_at: DateTime<Utc>,
    pub loaded_at: DateTime<Utc>,
    pub last_save_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Successful `set` calls since the last successful save.
    pub edits: u64,
}

/// Snapshot taken at the start of a save: the record, its baseline version
/// and the dirty set accumulated so far. Mutations that land during the
/// save accumulate in a fresh dirty set on the session.
#[derive(Debug, Clone)]
pub struct SaveSnapshot {
    pub record: Value,
    pub baseline: i64,
    pub dirty: DirtyState,
    pub edits: u64,
}

#[derive(Debug)]
pub struct Session {
    key: String,
    record: Value,
    /// Backend version observed at load or committed by the last save.
    baseline: i64,
    dirty: DirtyState,
    backups: VecDeque<Value>,
    backup_capacity: usize,
    meta: SessionMeta,
}

impl Session {
    pub fn new(key: impl Into<String>, record: Value, baseline: i64, backup_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            record,
            baseline,
            dirty: DirtyState::default(),
            backups: VecDeque::new(),
            backup_capacity,
            meta: SessionMeta {
                created_at: now,
                loaded_at: now,
                last_save_at: None,
                last_heartbeat_at: now,
                edits: 0,
            },
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn record(&self) -> &Value {
        &self.record
    }

    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn dirty(&self) -> &DirtyState {
        &self.dirty
    }

    pub fn backups(&self) -> Vec<Value> {
        self.backups.iter().cloned().collect()
    }

    pub fn touch(&mut self) {
        self.meta.last_heartbeat_at = Utc::now();
    }

    /// Read the record or a nested value. Touches the heartbeat.
    pub fn get(&mut self, path: Option<&str>) -> Result<Value> {
        self.touch();
        match path {
            None => Ok(self.record.clone()),
            Some(path) => get_path(&self.record, path).cloned().ok_or_else(|| {
                SyncError::InvalidPath(format!("'{}' not present in '{}'", path, self.key))
            }),
        }
    }

    /// Apply a mutation: replace the whole record (no path) or write one
    /// nested value. Marks dirty state, bumps the edit counter and touches
    /// the heartbeat. Validation happens in the store before this runs.
    pub fn set(&mut self, path: Option<&str>, value: Value) -> Result<()> {
        self.touch();
        match path {
            None => {
                self.record = value;
                self.dirty.mark_all();
            }
            Some(path) => {
                set_path(&mut self.record, path, value)?;
                self.dirty.mark_path(path);
            }
        }
        self.meta.edits += 1;
        Ok(())
    }

    /// Begin a save: clone the record and take the dirty set, leaving a
    /// fresh one behind for mutations that land while the save is in
    /// flight.
    pub fn begin_save(&mut self) -> SaveSnapshot {
        SaveSnapshot {
            record: self.record.clone(),
            baseline: self.baseline,
            dirty: std::mem::take(&mut self.dirty),
            edits: self.meta.edits,
        }
    }

    /// A save attempt failed transiently: fold its dirty set back so the
    /// next attempt retries the same changes.
    pub fn requeue_dirty(&mut self, taken: DirtyState) {
        let newer = std::mem::take(&mut self.dirty);
        self.dirty = taken;
        self.dirty.merge(newer);
    }

    /// Commit a successful save: advance the baseline, stamp the in-memory
    /// version for the next cycle, push the written snapshot onto the
    /// bounded backup ring and refresh metadata.
    pub fn commit_save(&mut self, written: Value, written_version: i64) {
        self.baseline = written_version;
        crate::core::value::set_record_version(&mut self.record, written_version + 1);
        if self.backup_capacity > 0 {
            if self.backups.len() == self.backup_capacity {
                self.backups.pop_front();
            }
            self.backups.push_back(written);
        }
        self.meta.last_save_at = Some(Utc::now());
        self.meta.edits = 0;
    }

    /// Refresh save metadata without touching the backend (no-op save).
    pub fn mark_saved_noop(&mut self) {
        self.meta.last_save_at = Some(Utc::now());
    }
}

/// One slot per active session. The `save_gate` serializes saves for the
/// session so a save fully completes (dirty set cleared or requeued) before
/// the next one reads it; `state` is held only for short, non-blocking
/// critical sections.
#[derive(Debug)]
pub struct SessionSlot {
    pub state: Mutex<Session>,
    pub save_gate: Mutex<()>,
}

/// Shared table of active sessions plus the per-key validator registry.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    validators: StdRwLock<HashMap<String, Vec<Arc<dyn SetValidator>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Session) -> Result<Arc<SessionSlot>> {
        let key = session.key().to_string();
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(SyncError::SessionExists(key));
        }
        let slot = Arc::new(SessionSlot {
            state: Mutex::new(session),
            save_gate: Mutex::new(()),
        });
        sessions.insert(key, slot.clone());
        Ok(slot)
    }

    pub async fn slot(&self, key: &str) -> Option<Arc<SessionSlot>> {
        let sessions = self.sessions.read().await;
        sessions.get(key).cloned()
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<SessionSlot>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(key)
    }

    pub async fn contains(&self, key: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(key)
    }

    /// Keys of all active sessions. Callers iterating this must tolerate a
    /// session being released before they reach it.
    pub async fn keys(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn register_validator(&self, key: &str, validator: Arc<dyn SetValidator>) -> Result<()> {
        let mut validators = self.validators.write()?;
        validators.entry(key.to_string()).or_default().push(validator);
        Ok(())
    }

    /// Run every validator registered for `key` against a proposed
    /// mutation. The first rejection wins.
    pub fn validate_set(&self, key: &str, path: Option<&str>, value: &Value) -> Result<()> {
        let validators = self.validators.read()?;
        if let Some(rules) = validators.get(key) {
            for rule in rules {
                rule.validate(key, path, value)?;
            }
        }
        Ok(())
    }
}
