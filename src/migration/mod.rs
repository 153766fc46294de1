//! Ordered, version-gated schema migrations.
//!
//! Transforms are registered against an integer version and applied on load
//! to any record whose `schemaVersion` is below them, in ascending order.
//! A failing transform is logged and skipped without advancing the record's
//! `schemaVersion` past it; the load pipeline never fails because a
//! migration did. Callers that want to escalate inspect the returned
//! [`MigrationReport`].

use crate::core::Result;
use crate::core::value::{schema_version, set_schema_version};
use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// One schema transform. Implemented for plain closures.
pub trait Migration: Send + Sync {
    fn migrate(&self, record: &mut Value) -> Result<()>;
}

impl<F> Migration for F
where
    F: Fn(&mut Value) -> Result<()> + Send + Sync,
{
    fn migrate(&self, record: &mut Value) -> Result<()> {
        self(record)
    }
}

/// Outcome of one [`MigrationRegistry::apply`] pass.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Versions applied successfully, in order.
    pub applied: Vec<i64>,
    /// Versions whose transform failed, with the error message.
    pub skipped: Vec<(i64, String)>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

#[derive(Default)]
pub struct MigrationRegistry {
    steps: RwLock<BTreeMap<i64, Arc<dyn Migration>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transform for `version`, replacing any previous one.
    pub fn register(&self, version: i64, migration: Arc<dyn Migration>) -> Result<()> {
        let mut steps = self.steps.write()?;
        if steps.insert(version, migration).is_some() {
            warn!("migration for version {} replaced", version);
        }
        Ok(())
    }

    pub fn registered_versions(&self) -> Result<Vec<i64>> {
        let steps = self.steps.read()?;
        Ok(steps.keys().copied().collect())
    }

    /// Fold every registered transform above the record's current
    /// `schemaVersion` over it in ascending order. Each success advances
    /// `schemaVersion` to that transform's version; each failure is
    /// recorded and skipped.
    pub fn apply(&self, record: &mut Value) -> Result<MigrationReport> {
        let pending: Vec<(i64, Arc<dyn Migration>)> = {
            let steps = self.steps.read()?;
            let current = schema_version(record);
            steps
                .range(current + 1..)
                .map(|(version, step)| (*version, step.clone()))
                .collect()
        };

        let mut report = MigrationReport::default();
        for (version, step) in pending {
            let mut candidate = record.clone();
            match step.migrate(&mut candidate) {
                Ok(()) => {
                    set_schema_version(&mut candidate, version);
                    *record = candidate;
                    report.applied.push(version);
                    debug!("migrated record to schema version {}", version);
                }
                Err(err) => {
                    warn!("migration to version {} skipped: {}", version, err);
                    report.skipped.push((version, err.to_string()));
                }
            }
        }
        Ok(report)
    }
}
