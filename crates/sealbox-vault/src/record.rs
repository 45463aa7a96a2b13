//! On-disk record model: one append-only version log per secret key.
//!
//! History is stored as a flat array of version entries indexed by version
//! number (`versions[i].version == i + 1`) rather than a recursively nested
//! chain, so version lookups are O(1) and nesting depth is bounded.  The
//! whole record — current version and history together — is serialized as
//! one JSON document and sealed as one blob.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sealbox_provider::error::{Result, SecretError};
use sealbox_provider::secret::Secret;

/// One version of a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VersionEntry {
    pub version: u32,
    pub value: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The full stored record for one key: every version, oldest first.
///
/// Invariants, checked on load: versions are contiguous starting at 1, and
/// `created_at` is identical across the whole log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SecretRecord {
    pub key: String,
    pub versions: Vec<VersionEntry>,
}

impl SecretRecord {
    /// An empty record for a key that has never been written.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            versions: Vec::new(),
        }
    }

    /// The current (most recent) version, if any.
    pub fn current(&self) -> Option<&VersionEntry> {
        self.versions.last()
    }

    /// The entry for version `n`, if present.
    pub fn entry(&self, version: u32) -> Option<&VersionEntry> {
        if version == 0 {
            return None;
        }
        // Contiguity makes the version number an index.
        self.versions.get(version as usize - 1)
    }

    /// Version numbers, newest first.
    pub fn version_numbers(&self) -> Vec<u32> {
        (1..=self.versions.len() as u32).rev().collect()
    }

    /// Append a new version and return its version number.
    ///
    /// The new entry gets `version = previous + 1` (1 for a fresh record),
    /// inherits `created_at` from the head of the log, and stamps
    /// `updated_at = now`.
    pub fn append(
        &mut self,
        value: String,
        metadata: BTreeMap<String, String>,
        tags: Vec<String>,
        schema: Option<String>,
        now: DateTime<Utc>,
    ) -> u32 {
        let created_at = self.versions.first().map_or(now, |head| head.created_at);
        let version = self.versions.len() as u32 + 1;

        self.versions.push(VersionEntry {
            version,
            value,
            metadata,
            tags,
            schema,
            created_at,
            updated_at: now,
        });

        version
    }

    /// Check the structural invariants of a record loaded from disk.
    ///
    /// Violations mean the blob decrypted cleanly but is not a record this
    /// engine wrote; they are reported as corruption so cleanup can target
    /// them.
    pub fn verify(&self) -> Result<()> {
        let Some(head) = self.versions.first() else {
            return Err(corrupt(&self.key, "record has no versions"));
        };

        for (index, entry) in self.versions.iter().enumerate() {
            if entry.version != index as u32 + 1 {
                return Err(corrupt(
                    &self.key,
                    &format!(
                        "version log not contiguous: entry {} has version {}",
                        index, entry.version
                    ),
                ));
            }
            if entry.created_at != head.created_at {
                return Err(corrupt(
                    &self.key,
                    &format!("created_at differs at version {}", entry.version),
                ));
            }
        }

        Ok(())
    }

    /// Materialize one version entry as a caller-facing [`Secret`].
    pub fn to_secret(&self, entry: &VersionEntry) -> Secret {
        Secret {
            key: self.key.clone(),
            value: entry.value.clone(),
            metadata: entry.metadata.clone(),
            tags: entry.tags.clone(),
            schema: entry.schema.clone(),
            version: entry.version,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

fn corrupt(key: &str, detail: &str) -> SecretError {
    // serde_json::Error is the parse-failure class; invariant violations are
    // the same kind of damage as an unparseable document.
    SecretError::Serialization(serde::de::Error::custom(format!(
        "corrupt record for {key}: {detail}"
    )))
}
