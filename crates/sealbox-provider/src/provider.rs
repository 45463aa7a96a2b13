//! The backend-agnostic provider contract.
//!
//! Every backend — the local encrypted engine, a KV server with native
//! versioning, a flat cloud secret API — implements [`SecretProvider`] with
//! the identical operation set and the identical error taxonomy
//! ([`SecretError`]).  Callers construct one provider from resolved
//! configuration and pass it by reference; there is no process-wide
//! provider state, so multiple configurations coexist in tests.
//!
//! Backends without native versioning must either emulate history (e.g. in
//! metadata) or return [`SecretError::Unsupported`] from the version
//! operations — silently dropping the guarantee is not an option.
//!
//! [`SecretError`]: crate::error::SecretError
//! [`SecretError::Unsupported`]: crate::error::SecretError::Unsupported

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BatchFailure, Result};
use crate::rotation::{RotationPolicy, ValueGenerator};
use crate::secret::{Secret, WriteOptions};

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Field to sort search results by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Sort by creation timestamp.
    Created,
    /// Sort by last-update timestamp.
    Updated,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// A search predicate with optional post-filter sorting and capping.
///
/// All populated criteria must match (logical AND): every metadata pair
/// equal, every requested tag present, the schema name equal, and
/// `created_at >= created_after`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Exact metadata key/value pairs the secret must carry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Tags the secret must all carry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Schema name the secret must reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Only secrets created at or after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,

    /// Sort field; unsorted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortField>,

    /// Sort direction (ignored when `sort` is unset).
    #[serde(default)]
    pub order: SortOrder,

    /// Maximum number of results, applied after sorting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SearchQuery {
    /// True when `secret` satisfies every populated criterion.
    pub fn matches(&self, secret: &Secret) -> bool {
        for (key, value) in &self.metadata {
            if secret.metadata.get(key) != Some(value) {
                return false;
            }
        }
        for tag in &self.tags {
            if !secret.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(schema) = &self.schema {
            if secret.schema.as_deref() != Some(schema.as_str()) {
                return false;
            }
        }
        if let Some(threshold) = self.created_after {
            if secret.created_at < threshold {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Outcome of a value-rotation request.
#[derive(Debug, Clone)]
pub enum ValueRotation {
    /// The value was regenerated; the new current secret is returned.
    Rotated(Secret),
    /// The policy's due date has not arrived; nothing was written.
    NotDue { next_rotation: DateTime<Utc> },
}

/// Outcome of a backup run.  Backups continue past per-item failures and
/// report them all at the end.
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    /// Keys successfully exported.
    pub exported: Vec<String>,
    /// Keys that could not be exported, with causes.
    pub failures: Vec<BatchFailure>,
}

/// Outcome of a restore run.  Restores continue past per-item failures and
/// report them all at the end.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Keys successfully restored.
    pub restored: Vec<String>,
    /// Keys that could not be restored, with causes.
    pub failures: Vec<BatchFailure>,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The capability set every secret backend must implement.
///
/// All operations are synchronous and bounded; `rotate_key` is the only
/// O(corpus) call.  Implementations must be safe to share across threads.
pub trait SecretProvider: Send + Sync {
    /// Retrieve the current version of a secret.
    fn get(&self, key: &str) -> Result<Secret>;

    /// Write a new version of a secret, creating it at version 1 if absent.
    ///
    /// Returns the stored record.  `created_at` is preserved from the first
    /// version; `updated_at` is set to now.
    fn set(&self, key: &str, value: &str, options: WriteOptions) -> Result<Secret>;

    /// Delete a secret and its entire version history.
    fn delete(&self, key: &str) -> Result<()>;

    /// List keys whose string form starts with `prefix`.  An empty prefix
    /// lists every key.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Return all secrets matching `query`, sorted and capped as requested.
    fn search(&self, query: &SearchQuery) -> Result<Vec<Secret>>;

    /// Retrieve a specific historical version of a secret.
    fn get_version(&self, key: &str, version: u32) -> Result<Secret>;

    /// List a secret's version numbers, newest first.
    fn list_versions(&self, key: &str) -> Result<Vec<u32>>;

    /// Make version `version`'s value and metadata current again by writing
    /// them as a *new* version.  History is never rewritten.
    fn rollback(&self, key: &str, version: u32) -> Result<Secret>;

    /// Re-encrypt the whole corpus under a freshly generated master key.
    ///
    /// Per-record failures do not abort the batch; they are reported
    /// together as [`SecretError::PartialFailure`].
    ///
    /// [`SecretError::PartialFailure`]: crate::error::SecretError::PartialFailure
    fn rotate_key(&self) -> Result<()>;

    /// Regenerate a secret's value if its rotation policy says it is due.
    ///
    /// `generator` overrides the policy's default character-set generator
    /// for this invocation only.
    fn rotate_value(
        &self,
        key: &str,
        generator: Option<&dyn ValueGenerator>,
    ) -> Result<ValueRotation>;

    /// Attach or replace the rotation policy of a secret.
    fn set_rotation_policy(&self, key: &str, policy: RotationPolicy) -> Result<()>;

    /// Read the rotation policy of a secret.
    fn get_rotation_policy(&self, key: &str) -> Result<RotationPolicy>;

    /// Export every secret as plain JSON, one file per key, under `dir`.
    fn backup(&self, dir: &Path) -> Result<BackupReport>;

    /// Re-import secrets previously exported with [`backup`](Self::backup).
    /// Each import is a normal versioned write.
    fn restore(&self, dir: &Path) -> Result<RestoreReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_with(
        tags: &[&str],
        metadata: &[(&str, &str)],
        schema: Option<&str>,
    ) -> Secret {
        Secret {
            key: "k".into(),
            value: "v".into(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            schema: schema.map(String::from),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_query_matches_everything() {
        let query = SearchQuery::default();
        assert!(query.matches(&secret_with(&[], &[], None)));
    }

    #[test]
    fn metadata_criteria_are_anded() {
        let query = SearchQuery {
            metadata: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("service".to_string(), "api".to_string()),
            ]),
            ..Default::default()
        };

        assert!(query.matches(&secret_with(
            &[],
            &[("env", "prod"), ("service", "api"), ("extra", "x")],
            None
        )));
        assert!(!query.matches(&secret_with(&[], &[("env", "prod")], None)));
        assert!(!query.matches(&secret_with(
            &[],
            &[("env", "dev"), ("service", "api")],
            None
        )));
    }

    #[test]
    fn tag_containment_requires_all_tags() {
        let query = SearchQuery {
            tags: vec!["x".into(), "y".into()],
            ..Default::default()
        };

        assert!(query.matches(&secret_with(&["x", "y", "z"], &[], None)));
        assert!(!query.matches(&secret_with(&["x"], &[], None)));
    }

    #[test]
    fn schema_and_created_after_filters() {
        let query = SearchQuery {
            schema: Some("database".into()),
            ..Default::default()
        };
        assert!(query.matches(&secret_with(&[], &[], Some("database"))));
        assert!(!query.matches(&secret_with(&[], &[], None)));

        let mut old = secret_with(&[], &[], None);
        old.created_at = Utc::now() - chrono::Duration::days(2);
        let query = SearchQuery {
            created_after: Some(Utc::now() - chrono::Duration::days(1)),
            ..Default::default()
        };
        assert!(!query.matches(&old));
    }
}
