//! Schema Management Types
//!
//! This module contains data structures for node-type schemas. A schema
//! declares the property shape for one `node_type`: a list of typed fields,
//! which of them are required, and the allowed values for enum fields.
//!
//! Schemas live in the dedicated `schemas` table (`node_type` primary key,
//! JSON definition, integer version) and are mutated only through
//! [`crate::services::SchemaService`], which enforces migration safety.
//!
//! ## Example Schema Definition
//!
//! ```json
//! {
//!   "description": "Task tracking schema",
//!   "fields": [
//!     {
//!       "name": "status",
//!       "type": "enum",
//!       "required": true,
//!       "values": ["OPEN", "IN_PROGRESS", "DONE"],
//!       "default": "OPEN",
//!       "description": "Status"
//!     },
//!     {
//!       "name": "due_date",
//!       "type": "date",
//!       "required": false,
//!       "description": "Due Date"
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Property type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Enum,
    Date,
    Number,
    Boolean,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Enum => "enum",
            FieldType::Date => "date",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        };
        write!(f, "{}", name)
    }
}

/// One field declaration within a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name as it appears in node properties
    pub name: String,

    /// Value type
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether the field must be present (it may still be `null`)
    #[serde(default)]
    pub required: bool,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Allowed values (enum fields only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,

    /// Default value applied when the field is absent on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl SchemaField {
    /// Simple text field
    pub fn text(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Text,
            required,
            description: None,
            values: None,
            default: None,
        }
    }

    /// Enum field with an allowed value set
    pub fn enumeration(
        name: impl Into<String>,
        values: Vec<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Enum,
            required,
            description: None,
            values: Some(values),
            default: None,
        }
    }

    /// Date field (`YYYY-MM-DD` values)
    pub fn date(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Date,
            required,
            description: None,
            values: None,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Schema definition for a node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Node type this schema governs
    pub node_type: String,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Field declarations
    #[serde(default)]
    pub fields: Vec<SchemaField>,

    /// Schema version, bumped on every admin mutation
    #[serde(default = "default_schema_version")]
    pub version: i64,
}

fn default_schema_version() -> i64 {
    1
}

/// Violations raised when node properties fail schema validation
#[derive(Error, Debug)]
pub enum SchemaViolation {
    #[error("Unknown field '{field}' for node type '{node_type}'")]
    UnknownField { node_type: String, field: String },

    #[error("Missing required field '{field}' for node type '{node_type}'")]
    MissingRequiredField { node_type: String, field: String },

    #[error("Field '{field}' expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        actual: String,
    },

    #[error("Field '{field}' value '{value}' is not one of the allowed enum values")]
    InvalidEnumValue { field: String, value: String },

    #[error("Field '{field}' value '{value}' is not a valid date (expected YYYY-MM-DD)")]
    InvalidDate { field: String, value: String },
}

impl Schema {
    /// Create a new schema at version 1
    pub fn new(node_type: impl Into<String>, fields: Vec<SchemaField>) -> Self {
        Self {
            node_type: node_type.into(),
            description: None,
            fields,
            version: 1,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a properties object against this schema
    ///
    /// Rules:
    /// - unknown fields are rejected
    /// - required fields must be present (but may be `null`)
    /// - present, non-null values must match the declared field type
    /// - enum values must be members of the declared value set
    /// - dates must parse as `YYYY-MM-DD`
    pub fn validate_properties(
        &self,
        properties: &serde_json::Value,
    ) -> Result<(), SchemaViolation> {
        let map = match properties.as_object() {
            Some(map) => map,
            // Non-object properties are caught by Node::validate
            None => return Ok(()),
        };

        for key in map.keys() {
            if self.field(key).is_none() {
                return Err(SchemaViolation::UnknownField {
                    node_type: self.node_type.clone(),
                    field: key.clone(),
                });
            }
        }

        for field in &self.fields {
            let value = match map.get(&field.name) {
                Some(value) => value,
                None => {
                    if field.required {
                        return Err(SchemaViolation::MissingRequiredField {
                            node_type: self.node_type.clone(),
                            field: field.name.clone(),
                        });
                    }
                    continue;
                }
            };

            if value.is_null() {
                continue;
            }

            Self::check_value(field, value)?;
        }

        Ok(())
    }

    /// Fill in declared defaults for absent fields (used on create)
    pub fn apply_defaults(&self, properties: &mut serde_json::Value) {
        let Some(map) = properties.as_object_mut() else {
            return;
        };
        for field in &self.fields {
            if let Some(default) = &field.default {
                map.entry(field.name.clone()).or_insert(default.clone());
            }
        }
    }

    fn check_value(
        field: &SchemaField,
        value: &serde_json::Value,
    ) -> Result<(), SchemaViolation> {
        match field.field_type {
            FieldType::Text => {
                if !value.is_string() {
                    return Err(type_mismatch(field, value));
                }
            }
            FieldType::Number => {
                if !value.is_number() {
                    return Err(type_mismatch(field, value));
                }
            }
            FieldType::Boolean => {
                if !value.is_boolean() {
                    return Err(type_mismatch(field, value));
                }
            }
            FieldType::Enum => {
                let Some(s) = value.as_str() else {
                    return Err(type_mismatch(field, value));
                };
                let allowed = field.values.as_deref().unwrap_or(&[]);
                if !allowed.iter().any(|v| v == s) {
                    return Err(SchemaViolation::InvalidEnumValue {
                        field: field.name.clone(),
                        value: s.to_string(),
                    });
                }
            }
            FieldType::Date => {
                let Some(s) = value.as_str() else {
                    return Err(type_mismatch(field, value));
                };
                if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                    return Err(SchemaViolation::InvalidDate {
                        field: field.name.clone(),
                        value: s.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn type_mismatch(field: &SchemaField, value: &serde_json::Value) -> SchemaViolation {
    let actual = match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    };
    SchemaViolation::TypeMismatch {
        field: field.name.clone(),
        expected: field.field_type,
        actual: actual.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_schema() -> Schema {
        Schema::new(
            "task",
            vec![
                SchemaField::enumeration(
                    "status",
                    vec![
                        "OPEN".to_string(),
                        "IN_PROGRESS".to_string(),
                        "DONE".to_string(),
                    ],
                    true,
                )
                .with_default(json!("OPEN")),
                SchemaField::enumeration(
                    "priority",
                    vec!["LOW".to_string(), "MEDIUM".to_string(), "HIGH".to_string()],
                    false,
                ),
                SchemaField::date("due_date", false),
                SchemaField::text("assignee", false),
            ],
        )
    }

    #[test]
    fn test_valid_properties_pass() {
        let schema = task_schema();
        let props = json!({
            "status": "OPEN",
            "priority": "HIGH",
            "due_date": "2026-02-01",
            "assignee": "alex"
        });
        assert!(schema.validate_properties(&props).is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let schema = task_schema();
        let props = json!({ "status": "OPEN", "points": 5 });
        assert!(matches!(
            schema.validate_properties(&props),
            Err(SchemaViolation::UnknownField { field, .. }) if field == "points"
        ));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let schema = task_schema();
        let props = json!({ "priority": "LOW" });
        assert!(matches!(
            schema.validate_properties(&props),
            Err(SchemaViolation::MissingRequiredField { field, .. }) if field == "status"
        ));
    }

    #[test]
    fn test_required_field_may_be_null() {
        let schema = task_schema();
        let props = json!({ "status": null });
        assert!(schema.validate_properties(&props).is_ok());
    }

    #[test]
    fn test_invalid_enum_value_rejected() {
        let schema = task_schema();
        let props = json!({ "status": "WAITING" });
        assert!(matches!(
            schema.validate_properties(&props),
            Err(SchemaViolation::InvalidEnumValue { value, .. }) if value == "WAITING"
        ));
    }

    #[test]
    fn test_bad_date_rejected() {
        let schema = task_schema();
        let props = json!({ "status": "OPEN", "due_date": "02/01/2026" });
        assert!(matches!(
            schema.validate_properties(&props),
            Err(SchemaViolation::InvalidDate { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = task_schema();
        let props = json!({ "status": "OPEN", "assignee": 42 });
        assert!(matches!(
            schema.validate_properties(&props),
            Err(SchemaViolation::TypeMismatch { field, .. }) if field == "assignee"
        ));
    }

    #[test]
    fn test_apply_defaults_fills_absent_fields() {
        let schema = task_schema();
        let mut props = json!({});
        schema.apply_defaults(&mut props);
        assert_eq!(props["status"], json!("OPEN"));
    }

    #[test]
    fn test_apply_defaults_keeps_explicit_values() {
        let schema = task_schema();
        let mut props = json!({ "status": "DONE" });
        schema.apply_defaults(&mut props);
        assert_eq!(props["status"], json!("DONE"));
    }

    #[test]
    fn test_schema_roundtrips_through_json() {
        let schema = task_schema();
        let encoded = serde_json::to_string(&schema).unwrap();
        let decoded: Schema = serde_json::from_str(&encoded).unwrap();
        assert_eq!(schema, decoded);
    }
}
