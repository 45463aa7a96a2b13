//! Named field-validation schemas.
//!
//! A schema is an optional contract for a secret's metadata fields: which
//! fields must be present, what type they hold, and what constraints apply.
//! Schemas are stored independently of secrets — one plain JSON document per
//! name under `schemas/` — and are referenced from a secret by name.  They
//! are never deleted automatically.
//!
//! Validation order per field set: required-field completeness first (fail
//! fast on the first missing field, in schema iteration order), then for
//! each present field: type, length bounds, pattern, enum membership — each
//! short-circuiting with the offending field name.  Metadata keys the schema
//! does not declare are accepted silently, so schemas stay
//! forward-compatible with new metadata.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sealbox_provider::error::{Result, SecretError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The type a schema field expects.  All metadata values are strings on the
/// wire; `Number` and `Boolean` constrain what the string must parse as.
/// `Password` behaves as `String` for validation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Password,
}

/// Constraints for one schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Expected type of the field value.
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether the field must be present.
    #[serde(default)]
    pub required: bool,

    /// Regular expression the value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Minimum value length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    /// Maximum value length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Closed set of allowed values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
}

/// A named validation contract for secret metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Optional expiry: secrets written under this schema get an
    /// `expires_at` stamp this many seconds in the future.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    pub fields: BTreeMap<String, Field>,
}

impl Schema {
    /// The expiry instant for a secret written at `now`, when a TTL is set.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.ttl_secs
            .map(|secs| now + Duration::seconds(secs as i64))
    }

    /// Structural checks applied when a schema is saved.
    fn check_well_formed(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SecretError::Validation {
                field: "name".into(),
                reason: "schema name is required".into(),
            });
        }
        if self.version.is_empty() {
            return Err(SecretError::Validation {
                field: "version".into(),
                reason: "schema version is required".into(),
            });
        }
        if self.fields.is_empty() {
            return Err(SecretError::Validation {
                field: "fields".into(),
                reason: "schema must define at least one field".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `metadata` against `schema`.
///
/// # Errors
///
/// Returns the first [`SecretError::Validation`] encountered, naming the
/// offending field.
pub fn validate(metadata: &BTreeMap<String, String>, schema: &Schema) -> Result<()> {
    // Completeness first: fail fast on the first missing required field.
    for (name, field) in &schema.fields {
        if field.required && !metadata.contains_key(name) {
            return Err(SecretError::Validation {
                field: name.clone(),
                reason: "required field is missing".into(),
            });
        }
    }

    for (name, value) in metadata {
        // Undeclared fields pass silently.
        let Some(field) = schema.fields.get(name) else {
            continue;
        };
        validate_field(name, value, field)?;
    }

    Ok(())
}

fn validate_field(name: &str, value: &str, field: &Field) -> Result<()> {
    match field.field_type {
        FieldType::String | FieldType::Password => {}
        FieldType::Number => {
            if value.parse::<f64>().is_err() {
                return Err(SecretError::Validation {
                    field: name.into(),
                    reason: "value is not a number".into(),
                });
            }
        }
        FieldType::Boolean => {
            if value != "true" && value != "false" {
                return Err(SecretError::Validation {
                    field: name.into(),
                    reason: "value is not \"true\" or \"false\"".into(),
                });
            }
        }
    }

    if let Some(min) = field.min_length {
        if value.len() < min {
            return Err(SecretError::Validation {
                field: name.into(),
                reason: format!("length {} is below minimum {min}", value.len()),
            });
        }
    }
    if let Some(max) = field.max_length {
        if value.len() > max {
            return Err(SecretError::Validation {
                field: name.into(),
                reason: format!("length {} exceeds maximum {max}", value.len()),
            });
        }
    }

    if let Some(pattern) = &field.pattern {
        let re = regex::Regex::new(pattern).map_err(|e| SecretError::Validation {
            field: name.into(),
            reason: format!("invalid pattern: {e}"),
        })?;
        if !re.is_match(value) {
            return Err(SecretError::Validation {
                field: name.into(),
                reason: format!("value does not match pattern {pattern}"),
            });
        }
    }

    if !field.enum_values.is_empty() && !field.enum_values.iter().any(|v| v == value) {
        return Err(SecretError::Validation {
            field: name.into(),
            reason: format!("value must be one of {:?}", field.enum_values),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// One JSON document per named schema under a `schemas/` directory.
pub(crate) struct SchemaStore {
    dir: PathBuf,
}

impl SchemaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(SecretError::Validation {
                field: "schema".into(),
                reason: format!("invalid schema name: {name:?}"),
            });
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Create or replace a schema document.
    pub fn put(&self, schema: &Schema) -> Result<()> {
        schema.check_well_formed()?;
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&schema.name)?;
        let json = serde_json::to_vec_pretty(schema)?;
        std::fs::write(&path, json)?;

        tracing::info!(name = %schema.name, version = %schema.version, "stored schema");
        Ok(())
    }

    /// Load a schema by name.
    pub fn get(&self, name: &str) -> Result<Schema> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(SecretError::SchemaNotFound { name: name.into() });
        }
        let data = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Names of all stored schemas, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a schema by name.  Schemas are never deleted automatically;
    /// this is the only removal path.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(SecretError::SchemaNotFound { name: name.into() });
        }
        std::fs::remove_file(&path)?;
        tracing::info!(name = name, "deleted schema");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
