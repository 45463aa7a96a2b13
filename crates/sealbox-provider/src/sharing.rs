//! Cross-provider secret sharing.
//!
//! A secret can be copied from one provider to another (e.g. local engine to
//! a team server) with provenance recorded in reserved metadata: the target
//! copy carries `shared_from` and `shared_at`, optionally `expires_at`.
//! A previously shared copy can later be re-synced from its source or
//! revoked.  Everything here goes through the [`SecretProvider`] contract
//! only, so any pair of backends can participate.

use chrono::{DateTime, Utc};

use crate::error::{Result, SecretError};
use crate::provider::SecretProvider;
use crate::secret::{
    META_EXPIRES_AT, META_SHARED_AT, META_SHARED_FROM, META_SYNCED_AT, Secret, WriteOptions,
};

/// Copy `key` from `source` to `target`, stamping sharing provenance.
///
/// The target copy keeps the source's metadata and tags, plus
/// `shared_from`/`shared_at` and an optional `expires_at`.
///
/// # Errors
///
/// Fails with [`SecretError::Validation`] when the source secret carries an
/// `expires_at` in the past.
pub fn share_secret(
    source: &dyn SecretProvider,
    target: &dyn SecretProvider,
    key: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<Secret> {
    let secret = source.get(key)?;
    ensure_not_expired(&secret)?;

    let mut metadata = secret.metadata.clone();
    metadata.insert(META_SHARED_FROM.to_string(), key.to_string());
    metadata.insert(META_SHARED_AT.to_string(), Utc::now().to_rfc3339());
    if let Some(expiry) = expires_at {
        metadata.insert(META_EXPIRES_AT.to_string(), expiry.to_rfc3339());
    }

    let shared = target.set(
        key,
        &secret.value,
        WriteOptions {
            metadata,
            tags: secret.tags.clone(),
            schema: secret.schema.clone(),
            allow_reserved: true,
        },
    )?;

    tracing::info!(key = key, "shared secret to target provider");
    Ok(shared)
}

/// Refresh a previously shared copy of `key` in `target` from `source`,
/// stamping `synced_at`.
///
/// # Errors
///
/// Fails with [`SecretError::Validation`] when the target copy does not
/// carry `shared_from` (i.e. it was never shared).
pub fn sync_shared_secret(
    source: &dyn SecretProvider,
    target: &dyn SecretProvider,
    key: &str,
) -> Result<Secret> {
    let existing = target.get(key)?;
    ensure_shared(&existing)?;

    let current = source.get(key)?;

    let mut metadata = existing.metadata.clone();
    metadata.insert(META_SYNCED_AT.to_string(), Utc::now().to_rfc3339());

    let synced = target.set(
        key,
        &current.value,
        WriteOptions {
            metadata,
            tags: current.tags.clone(),
            schema: existing.schema.clone(),
            allow_reserved: true,
        },
    )?;

    tracing::info!(key = key, "synced shared secret from source provider");
    Ok(synced)
}

/// Remove a previously shared copy of `key` from `target`.
///
/// # Errors
///
/// Fails with [`SecretError::Validation`] when the target copy does not
/// carry `shared_from`.
pub fn revoke_sharing(target: &dyn SecretProvider, key: &str) -> Result<()> {
    let existing = target.get(key)?;
    ensure_shared(&existing)?;

    target.delete(key)?;
    tracing::info!(key = key, "revoked shared secret");
    Ok(())
}

fn ensure_shared(secret: &Secret) -> Result<()> {
    if secret
        .metadata
        .get(META_SHARED_FROM)
        .is_none_or(|v| v.is_empty())
    {
        return Err(SecretError::Validation {
            field: META_SHARED_FROM.into(),
            reason: "secret was not previously shared".into(),
        });
    }
    Ok(())
}

fn ensure_not_expired(secret: &Secret) -> Result<()> {
    if let Some(raw) = secret.metadata.get(META_EXPIRES_AT) {
        if let Ok(expiry) = DateTime::parse_from_rfc3339(raw) {
            if Utc::now() > expiry {
                return Err(SecretError::Validation {
                    field: META_EXPIRES_AT.into(),
                    reason: "secret has expired".into(),
                });
            }
        }
    }
    Ok(())
}
