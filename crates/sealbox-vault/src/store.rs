//! Encrypted versioned record storage on a filesystem tree.
//!
//! Each logical key maps to one file at the corresponding relative path
//! under the secrets root (slashes in keys produce nested directories).
//! File contents are `nonce(12) || AES-256-GCM(JSON record)` — the record
//! carries the full version log, so a single read serves current-version
//! and historical lookups alike.
//!
//! Writes are last-writer-wins whole-file replacements with no optimistic
//! concurrency token; serializing writers to the same key is the provider
//! lock's job (see `local`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use sealbox_provider::error::{Result, SecretError};
use sealbox_provider::secret::{Secret, validate_key};

use crate::crypto::Cipher;
use crate::keychain::MASTER_KEY_NAME;
use crate::record::SecretRecord;

/// File-tree store of encrypted, versioned secret records.
pub(crate) struct RecordStore {
    secrets_dir: PathBuf,
    cipher: Cipher,
}

impl RecordStore {
    pub fn new(secrets_dir: impl Into<PathBuf>, cipher: Cipher) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
            cipher,
        }
    }

    /// Map a validated key onto its file path under the secrets root.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.secrets_dir.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    // -- Record I/O ---------------------------------------------------------

    /// Load and decrypt the record for `key` under the canonical master key.
    pub fn load(&self, key: &str) -> Result<SecretRecord> {
        self.load_as(key, MASTER_KEY_NAME)
    }

    /// Load and decrypt the record for `key` under an explicit key name.
    /// Used by master-key rotation, which reads under either key mid-flight.
    pub fn load_as(&self, key: &str, key_name: &str) -> Result<SecretRecord> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(SecretError::SecretNotFound { key: key.into() });
        }

        let sealed = std::fs::read(&path)?;
        let plaintext = self.cipher.decrypt(key_name, &sealed)?;
        let record: SecretRecord = serde_json::from_slice(&plaintext)?;
        record.verify()?;

        tracing::debug!(key = key, versions = record.versions.len(), "loaded record");
        Ok(record)
    }

    /// Serialize, encrypt and write a record under the canonical master key.
    pub fn save(&self, record: &SecretRecord) -> Result<()> {
        self.save_as(record, MASTER_KEY_NAME)
    }

    /// Serialize, encrypt and write a record under an explicit key name.
    pub fn save_as(&self, record: &SecretRecord, key_name: &str) -> Result<()> {
        let path = self.path_for(&record.key)?;
        let plaintext = serde_json::to_vec(record)?;
        let sealed = self.cipher.encrypt(key_name, &plaintext)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &sealed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }

    // -- Contract operations ------------------------------------------------

    /// Current version of a secret.
    pub fn get(&self, key: &str) -> Result<Secret> {
        let record = self.load(key)?;
        let entry = record.current().expect("verified record is non-empty");
        Ok(record.to_secret(entry))
    }

    /// Append a new version (creating the record at version 1 if absent)
    /// and return the stored secret.
    pub fn set(
        &self,
        key: &str,
        value: &str,
        metadata: BTreeMap<String, String>,
        tags: Vec<String>,
        schema: Option<String>,
    ) -> Result<Secret> {
        let mut record = match self.load(key) {
            Ok(record) => record,
            Err(SecretError::SecretNotFound { .. }) => SecretRecord::new(key),
            Err(e) => return Err(e),
        };

        let version = record.append(value.to_string(), metadata, tags, schema, Utc::now());
        self.save(&record)?;

        tracing::info!(key = key, version = version, "stored secret");
        let entry = record.current().expect("record has a version after append");
        Ok(record.to_secret(entry))
    }

    /// Delete a secret and its entire history.
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(SecretError::SecretNotFound { key: key.into() });
        }
        std::fs::remove_file(&path)?;
        tracing::info!(key = key, "deleted secret");
        Ok(())
    }

    /// Keys whose string form starts with `prefix`, sorted.  A missing root
    /// yields an empty list, not an error.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.secrets_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        collect_keys(&self.secrets_dir, &self.secrets_dir, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();

        tracing::debug!(prefix = prefix, count = keys.len(), "listed secrets");
        Ok(keys)
    }

    /// A specific historical version of a secret.
    pub fn get_version(&self, key: &str, version: u32) -> Result<Secret> {
        let record = self.load(key)?;
        let entry = record
            .entry(version)
            .ok_or(SecretError::VersionNotFound {
                key: key.into(),
                version,
            })?;
        Ok(record.to_secret(entry))
    }

    /// Version numbers of a secret, newest first.
    pub fn list_versions(&self, key: &str) -> Result<Vec<u32>> {
        Ok(self.load(key)?.version_numbers())
    }

    /// Write version `version`'s value, metadata and tags as a new current
    /// version.  History is never rewritten.
    pub fn rollback(&self, key: &str, version: u32) -> Result<Secret> {
        let mut record = self.load(key)?;
        let target = record
            .entry(version)
            .cloned()
            .ok_or(SecretError::VersionNotFound {
                key: key.into(),
                version,
            })?;

        let new_version = record.append(
            target.value,
            target.metadata,
            target.tags,
            target.schema,
            Utc::now(),
        );
        self.save(&record)?;

        tracing::info!(
            key = key,
            from_version = version,
            new_version = new_version,
            "rolled back secret"
        );
        let entry = record.current().expect("record has a version after append");
        Ok(record.to_secret(entry))
    }

    /// Delete every record that fails decryption or parsing; returns the
    /// removed keys.  Destructive: each key is logged before removal.
    pub fn cleanup_invalid(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();

        for key in self.list("")? {
            match self.load(&key) {
                Ok(_) => {}
                Err(e) if e.is_corruption() => {
                    tracing::warn!(key = %key, error = %e, "removing unreadable secret");
                    let path = self.path_for(&key)?;
                    std::fs::remove_file(&path)?;
                    removed.push(key);
                }
                // Custody or I/O problems are not evidence the record itself
                // is bad; leave it in place.
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping secret during cleanup");
                }
            }
        }

        Ok(removed)
    }
}

/// Recursively collect relative file paths as slash-delimited keys.
fn collect_keys(dir: &Path, base: &Path, keys: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(&path, base, keys)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}
