//! Declarative record shape validation.
//!
//! A schema maps field names to `{required?, type?, nested?}` and is used
//! only for validation, never for defaulting. Validation on load is
//! advisory (logged by the engine); validation on an explicit `set` blocks
//! that mutation.

use crate::core::value::json_type_name;
use crate::core::{Result, SyncError};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Array,
    Object,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Null => value.is_null(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            // An integer is an acceptable float.
            FieldType::Float => value.is_number(),
            FieldType::String => value.is_string(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Null => "null",
            FieldType::Boolean => "boolean",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldSpec {
    pub required: bool,
    pub field_type: Option<FieldType>,
    pub nested: Option<Schema>,
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                required: true,
                field_type: Some(field_type),
                nested: None,
            },
        );
        self
    }

    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                required: false,
                field_type: Some(field_type),
                nested: None,
            },
        );
        self
    }

    pub fn nested(mut self, name: impl Into<String>, required: bool, schema: Schema) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                required,
                field_type: Some(FieldType::Object),
                nested: Some(schema),
            },
        );
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Recursive structural check. The first violation is returned as the
    /// error, with the offending dotted path in the message.
    pub fn validate(&self, record: &Value) -> Result<()> {
        self.validate_at(record, "")
    }

    fn validate_at(&self, value: &Value, prefix: &str) -> Result<()> {
        let object = value.as_object().ok_or_else(|| {
            SyncError::Validation(format!(
                "expected object at '{}', got {}",
                display_path(prefix, ""),
                json_type_name(value)
            ))
        })?;

        for (name, spec) in &self.fields {
            let path = display_path(prefix, name);
            match object.get(name) {
                None => {
                    if spec.required {
                        return Err(SyncError::Validation(format!(
                            "required field '{}' is missing",
                            path
                        )));
                    }
                }
                Some(field_value) => {
                    if let Some(expected) = spec.field_type {
                        if !expected.matches(field_value) {
                            return Err(SyncError::Validation(format!(
                                "field '{}' expected {}, got {}",
                                path,
                                expected.name(),
                                json_type_name(field_value)
                            )));
                        }
                    }
                    if let Some(nested) = &spec.nested {
                        nested.validate_at(field_value, &path)?;
                    }
                }
            }
        }

        Ok(())
    }
}

fn display_path(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, true) => "<root>".to_string(),
        (true, false) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}.{}", prefix, name),
    }
}
