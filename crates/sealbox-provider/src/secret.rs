//! The [`Secret`] record and its identifier rules.
//!
//! A secret is addressed by a single canonical identifier: a path-like,
//! slash-delimited key (`app/db/password`).  Keys are stable for the life of
//! the secret; slashes map to nested directories in filesystem-backed
//! engines.
//!
//! Metadata is a flat string-to-string map.  A handful of keys are reserved
//! for the store itself (rotation bookkeeping, sharing provenance, expiry)
//! and are rejected when supplied by a caller — they must never be
//! overwritten silently.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SecretError};

/// Metadata keys reserved for the store.  User writes naming one of these
/// are rejected with a [`SecretError::Validation`] unless the write
/// explicitly opts in (rotation, sharing and restore paths do).
pub const RESERVED_METADATA_KEYS: [&str; 8] = [
    "rotation_policy",
    "previous_value",
    "last_rotation",
    "next_rotation",
    "shared_from",
    "shared_at",
    "synced_at",
    "expires_at",
];

/// Reserved key: serialized rotation policy.
pub const META_ROTATION_POLICY: &str = "rotation_policy";
/// Reserved key: the value held before the most recent value rotation.
pub const META_PREVIOUS_VALUE: &str = "previous_value";
/// Reserved key: RFC 3339 timestamp of the most recent value rotation.
pub const META_LAST_ROTATION: &str = "last_rotation";
/// Reserved key: RFC 3339 timestamp when the next value rotation is due.
pub const META_NEXT_ROTATION: &str = "next_rotation";
/// Reserved key: the source key a shared secret was copied from.
pub const META_SHARED_FROM: &str = "shared_from";
/// Reserved key: RFC 3339 timestamp when the secret was shared.
pub const META_SHARED_AT: &str = "shared_at";
/// Reserved key: RFC 3339 timestamp of the most recent share sync.
pub const META_SYNCED_AT: &str = "synced_at";
/// Reserved key: RFC 3339 expiry timestamp.
pub const META_EXPIRES_AT: &str = "expires_at";

/// True if `name` is one of the store-reserved metadata keys.
pub fn is_reserved_metadata_key(name: &str) -> bool {
    RESERVED_METADATA_KEYS.contains(&name)
}

/// Check that `key` is a well-formed secret identifier.
///
/// Keys are non-empty, slash-delimited relative paths with no empty, `.` or
/// `..` segments and no backslashes, so they can be mapped onto a directory
/// tree without escaping it.
///
/// # Errors
///
/// Returns [`SecretError::Validation`] naming field `key`.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SecretError::Validation {
            field: "key".into(),
            reason: "key must not be empty".into(),
        });
    }
    if key.contains('\\') {
        return Err(SecretError::Validation {
            field: "key".into(),
            reason: "key must use forward slashes".into(),
        });
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(SecretError::Validation {
            field: "key".into(),
            reason: "key must not start or end with a slash".into(),
        });
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(SecretError::Validation {
                field: "key".into(),
                reason: format!("invalid path segment in key: {key:?}"),
            });
        }
    }
    Ok(())
}

/// A secret with its metadata, as returned by every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// Canonical path-like identifier, stable for the life of the secret.
    pub key: String,

    /// The protected payload.  Opaque to the store except for rotation
    /// generators.
    pub value: String,

    /// User metadata plus store-reserved keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    /// Free-form tags used by search containment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Name of the schema this secret is validated against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Monotonically increasing version number, starting at 1.
    pub version: u32,

    /// Fixed at first write; identical across every version of the key.
    pub created_at: DateTime<Utc>,

    /// Set on every write.
    pub updated_at: DateTime<Utc>,
}

/// Optional attributes accepted by [`SecretProvider::set`].
///
/// [`SecretProvider::set`]: crate::provider::SecretProvider::set
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// User metadata for the new version.
    pub metadata: BTreeMap<String, String>,

    /// Tags for the new version.
    pub tags: Vec<String>,

    /// Schema to validate this write against (and record on the secret).
    pub schema: Option<String>,

    /// Permit reserved metadata keys in `metadata`.  Intended for trusted
    /// flows that legitimately stamp provenance (sharing, restore); plain
    /// caller writes leave this false and are rejected when they name a
    /// reserved key.
    pub allow_reserved: bool,
}

impl WriteOptions {
    /// Options carrying only user metadata.
    pub fn with_metadata(metadata: BTreeMap<String, String>) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys_accepted() {
        for key in ["app", "app/db/password", "a/b/c/d", "x-1/y_2.bak"] {
            assert!(validate_key(key).is_ok(), "expected {key:?} to be valid");
        }
    }

    #[test]
    fn invalid_keys_rejected() {
        for key in [
            "",
            "/app",
            "app/",
            "app//db",
            "../escape",
            "app/../db",
            "app/./db",
            "app\\db",
        ] {
            let err = validate_key(key).unwrap_err();
            assert!(
                matches!(err, SecretError::Validation { ref field, .. } if field == "key"),
                "expected {key:?} to be rejected"
            );
        }
    }

    #[test]
    fn reserved_keys_recognized() {
        assert!(is_reserved_metadata_key("rotation_policy"));
        assert!(is_reserved_metadata_key("expires_at"));
        assert!(!is_reserved_metadata_key("environment"));
    }

    #[test]
    fn secret_json_roundtrip() {
        let secret = Secret {
            key: "app/db/password".into(),
            value: "p@ss1".into(),
            metadata: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            tags: vec!["db".into()],
            schema: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let json = serde_json::to_string(&secret).unwrap();
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(back, secret);

        // Empty collections are omitted from the wire form.
        assert!(!json.contains("\"schema\""));
    }
}
