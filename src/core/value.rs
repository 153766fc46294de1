//! Helpers for working with record values.
//!
//! Records are arbitrary JSON objects; the engine reserves the `version`,
//! `schemaVersion` and `createdAt` fields at the top level. Key paths are
//! dotted strings (`"Inventory.Slots"`); a path segment addresses a key in a
//! nested JSON object.

use crate::core::{Result, SyncError};
use serde_json::{Map, Value, json};

/// Reserved field holding the record's monotonically increasing version.
pub const VERSION_FIELD: &str = "version";

/// Reserved field holding the record's schema version for migrations.
pub const SCHEMA_VERSION_FIELD: &str = "schemaVersion";

/// Reserved field holding the record's creation timestamp (RFC 3339).
pub const CREATED_AT_FIELD: &str = "createdAt";

pub fn record_version(record: &Value) -> i64 {
    record
        .get(VERSION_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

pub fn set_record_version(record: &mut Value, version: i64) {
    if let Some(map) = record.as_object_mut() {
        map.insert(VERSION_FIELD.to_string(), json!(version));
    }
}

pub fn schema_version(record: &Value) -> i64 {
    record
        .get(SCHEMA_VERSION_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

pub fn set_schema_version(record: &mut Value, version: i64) {
    if let Some(map) = record.as_object_mut() {
        map.insert(SCHEMA_VERSION_FIELD.to_string(), json!(version));
    }
}

/// Read the value at a dotted key path. Returns `None` when any segment is
/// missing or a non-object intermediate blocks descent.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write a value at a dotted key path, creating intermediate objects as
/// needed. A non-object intermediate is replaced by an object so the path
/// always becomes addressable.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        return Err(SyncError::InvalidPath("empty key path".to_string()));
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }

    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SyncError::InvalidPath(format!(
            "key path '{}' contains an empty segment",
            path
        )));
    }

    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let map = current
            .as_object_mut()
            .ok_or_else(|| SyncError::InvalidPath(format!("cannot descend into '{}'", segment)))?;
        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }

    let map = current
        .as_object_mut()
        .ok_or_else(|| SyncError::InvalidPath(format!("key path '{}' is not addressable", path)))?;
    map.insert(segments[segments.len() - 1].to_string(), value);
    Ok(())
}

/// Deep-merge `defaults` into `record` without overwriting any existing key.
/// Only fills in fields the record does not have yet; nested objects recurse.
pub fn merge_defaults(record: &mut Value, defaults: &Value) {
    let Some(default_map) = defaults.as_object() else {
        return;
    };
    if !record.is_object() {
        return;
    }
    let record_map = record.as_object_mut().unwrap_or_else(|| unreachable!());

    for (key, default_value) in default_map {
        match record_map.get_mut(key) {
            None => {
                record_map.insert(key.clone(), default_value.clone());
            }
            Some(existing) => {
                if existing.is_object() && default_value.is_object() {
                    merge_defaults(existing, default_value);
                }
                // A present non-object value always wins over the default.
            }
        }
    }
}

/// Human-readable JSON type name for diagnostics.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_path() {
        let mut record = json!({"Coins": 0});
        set_path(&mut record, "Inventory.Slots", json!(20)).unwrap();
        assert_eq!(get_path(&record, "Inventory.Slots"), Some(&json!(20)));
        assert_eq!(get_path(&record, "Coins"), Some(&json!(0)));
        assert_eq!(get_path(&record, "Missing.Path"), None);
    }

    #[test]
    fn test_set_path_replaces_non_object_intermediate() {
        let mut record = json!({"Stats": 5});
        set_path(&mut record, "Stats.Level", json!(2)).unwrap();
        assert_eq!(get_path(&record, "Stats.Level"), Some(&json!(2)));
    }

    #[test]
    fn test_set_path_rejects_empty_segments() {
        let mut record = json!({});
        assert!(set_path(&mut record, "", json!(1)).is_err());
        assert!(set_path(&mut record, "a..b", json!(1)).is_err());
    }

    #[test]
    fn test_merge_defaults_fills_only_missing() {
        let mut record = json!({"Coins": 100, "Settings": {"Music": false}});
        let defaults = json!({
            "Coins": 0,
            "Gems": 5,
            "Settings": {"Music": true, "Sfx": true}
        });
        merge_defaults(&mut record, &defaults);
        assert_eq!(record["Coins"], json!(100));
        assert_eq!(record["Gems"], json!(5));
        assert_eq!(record["Settings"]["Music"], json!(false));
        assert_eq!(record["Settings"]["Sfx"], json!(true));
    }

    #[test]
    fn test_version_helpers() {
        let mut record = json!({});
        assert_eq!(record_version(&record), 0);
        set_record_version(&mut record, 3);
        assert_eq!(record_version(&record), 3);
        set_schema_version(&mut record, 2);
        assert_eq!(schema_version(&record), 2);
    }
}
