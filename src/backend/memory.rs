//! In-memory backend used by the test suites and the demo binary.

use crate::backend::{KvBackend, UpdateFn};
use crate::core::{Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A `HashMap`-backed [`KvBackend`].
///
/// Supports queuing transient failures with [`MemoryBackend::fail_next`] so
/// retry paths can be exercised deterministically.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Value>>,
    fail_next: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` backend calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Store a blob directly, bypassing the trait surface. Test setup only.
    pub async fn insert_raw(&self, key: &str, value: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
    }

    /// Read a blob directly, bypassing the trait surface and fault injection.
    pub async fn peek(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_fault(&self, op: &str, key: &str) -> Result<()> {
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if remaining > 0 {
            return Err(SyncError::Backend(format!(
                "injected transient failure ({} '{}')",
                op, key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check_fault("get", key)?;
        let entries = self.entries.lock()?;
        Ok(entries.get(key).cloned())
    }

    async fn update(
        &self,
        key: &str,
        apply: &mut UpdateFn<'_>,
        _ttl_hint: Option<Duration>,
    ) -> Result<Option<Value>> {
        self.check_fault("update", key)?;
        let mut entries = self.entries.lock()?;
        let current = entries.get(key);
        match apply(current) {
            Some(next) => {
                entries.insert(key.to_string(), next.clone());
                Ok(Some(next))
            }
            None => Ok(entries.get(key).cloned()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_fault("delete", key)?;
        let mut entries = self.entries.lock()?;
        entries.remove(key);
        Ok(())
    }
}
