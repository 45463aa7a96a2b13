//! The local encrypted secret engine.
//!
//! [`LocalVault`] composes the keychain, cipher, record store, schema store,
//! search scan and rotation engines behind the [`SecretProvider`] contract.
//! It is constructed explicitly from a [`LocalVaultConfig`] and passed by
//! reference — there is no process-wide engine state, so multiple
//! configurations coexist in one process (and in tests).
//!
//! # On-disk layout
//!
//! ```text
//! <data_dir>/
//!   secrets/            one sealed record per key, nested by path segment
//!   schemas/            one plain JSON document per named schema
//!   keys/               file-keychain key files (non-macOS platforms)
//!   rotation.journal    present only while a master-key rotation is in flight
//! ```
//!
//! # Locking
//!
//! One `RwLock` guards the engine: mutations (`set`, `delete`, rotation,
//! restore, cleanup) take the write guard, reads (`get`, `list`, `search`,
//! version lookups, backup) take the read guard.  Master-key rotation holds
//! the write guard across re-encryption *and* the key swap, trading
//! availability for the guarantee that no write lands under the old key
//! once records have started moving to the new one.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use sealbox_provider::error::{BatchFailure, Result, SecretError};
use sealbox_provider::provider::{
    BackupReport, RestoreReport, SearchQuery, SecretProvider, ValueRotation,
};
use sealbox_provider::rotation::{RotationPolicy, ValueGenerator};
use sealbox_provider::secret::{
    META_EXPIRES_AT, Secret, WriteOptions, is_reserved_metadata_key, validate_key,
};

use crate::crypto::Cipher;
use crate::keychain::{Keychain, MASTER_KEY_NAME, platform_keychain};
use crate::rotation::{self, KeyRotator};
use crate::schema::{Schema, SchemaStore, validate};
use crate::search;
use crate::store::RecordStore;

/// Name of the rotation journal file inside the data directory.
const JOURNAL_FILE: &str = "rotation.journal";

/// Construction parameters for a [`LocalVault`].
#[derive(Debug, Clone)]
pub struct LocalVaultConfig {
    /// Root directory of the engine's on-disk state.
    pub data_dir: PathBuf,

    /// Default target for [`LocalVault::backup_all`] /
    /// [`LocalVault::restore_all`].  The contract-level
    /// [`backup`](SecretProvider::backup) and
    /// [`restore`](SecretProvider::restore) take an explicit directory and
    /// ignore this.
    pub backup_dir: Option<PathBuf>,
}

impl LocalVaultConfig {
    /// Configuration rooted at `data_dir`, with no backup directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_dir: None,
        }
    }

    /// Set the default backup directory.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }
}

/// Filesystem-backed encrypted secret engine.
pub struct LocalVault {
    keychain: Arc<dyn Keychain>,
    store: RecordStore,
    schemas: SchemaStore,
    journal_path: PathBuf,
    backup_dir: Option<PathBuf>,
    lock: RwLock<()>,
}

impl LocalVault {
    /// Open (or initialize) an engine with the platform's default keychain.
    ///
    /// Creates the directory layout and, when no rotation is in flight,
    /// generates the initial master key on first use.
    pub fn open(config: LocalVaultConfig) -> Result<Self> {
        let keychain: Arc<dyn Keychain> =
            Arc::from(platform_keychain(&config.data_dir.join("keys")));
        Self::open_with_keychain(config, keychain)
    }

    /// Open (or initialize) an engine with an explicit keychain.
    pub fn open_with_keychain(
        config: LocalVaultConfig,
        keychain: Arc<dyn Keychain>,
    ) -> Result<Self> {
        let data_dir = &config.data_dir;
        std::fs::create_dir_all(data_dir.join("secrets"))?;
        std::fs::create_dir_all(data_dir.join("schemas"))?;

        let journal_path = data_dir.join(JOURNAL_FILE);
        if journal_path.exists() {
            tracing::warn!(
                "rotation journal present: run resume_rotation() or abort_rotation() before writing"
            );
        } else if !keychain.exists(MASTER_KEY_NAME)? {
            keychain.generate(MASTER_KEY_NAME)?;
            tracing::info!("generated initial master key");
        }

        let cipher = Cipher::new(keychain.clone());
        let store = RecordStore::new(data_dir.join("secrets"), cipher);
        let schemas = SchemaStore::new(data_dir.join("schemas"));

        tracing::info!(data_dir = %data_dir.display(), "opened local vault");
        Ok(Self {
            keychain,
            store,
            schemas,
            journal_path,
            backup_dir: config.backup_dir,
            lock: RwLock::new(()),
        })
    }

    // Every mutation is a whole-file replacement, so on-disk state stays
    // consistent even if a panicking thread poisoned the lock; recover the
    // guard instead of propagating the poison.
    fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn rotator(&self) -> KeyRotator<'_> {
        KeyRotator::new(&self.store, self.keychain.as_ref(), self.journal_path.clone())
    }

    // -- Schema management --------------------------------------------------

    /// Create or replace a named schema.
    pub fn put_schema(&self, schema: &Schema) -> Result<()> {
        let _guard = self.write_guard();
        self.schemas.put(schema)
    }

    /// Load a schema by name.
    pub fn get_schema(&self, name: &str) -> Result<Schema> {
        let _guard = self.read_guard();
        self.schemas.get(name)
    }

    /// Names of all stored schemas.
    pub fn list_schemas(&self) -> Result<Vec<String>> {
        let _guard = self.read_guard();
        self.schemas.list()
    }

    /// Delete a schema by name.  Secrets referencing it keep their reference
    /// and fail future validated writes until it is recreated.
    pub fn delete_schema(&self, name: &str) -> Result<()> {
        let _guard = self.write_guard();
        self.schemas.delete(name)
    }

    // -- Maintenance --------------------------------------------------------

    /// Finish a master-key rotation interrupted by a crash.  No-op when no
    /// journal is present.
    pub fn resume_rotation(&self) -> Result<()> {
        let _guard = self.write_guard();
        self.rotator().resume()
    }

    /// Roll back an interrupted master-key rotation.  Only possible before
    /// the key swap; afterwards use [`resume_rotation`](Self::resume_rotation).
    pub fn abort_rotation(&self) -> Result<()> {
        let _guard = self.write_guard();
        self.rotator().abort()
    }

    /// Delete every record that can no longer be decrypted or parsed.
    /// Destructive; every removed key is logged before deletion and
    /// returned to the caller.
    pub fn cleanup_invalid_secrets(&self) -> Result<Vec<String>> {
        let _guard = self.write_guard();
        self.store.cleanup_invalid()
    }

    // -- Configured backup directory ----------------------------------------

    fn configured_backup_dir(&self) -> Result<&Path> {
        self.backup_dir
            .as_deref()
            .ok_or_else(|| SecretError::Validation {
                field: "backup_dir".into(),
                reason: "no backup directory configured".into(),
            })
    }

    /// Export every secret to the backup directory from the configuration.
    pub fn backup_all(&self) -> Result<BackupReport> {
        let dir = self.configured_backup_dir()?.to_path_buf();
        self.backup(&dir)
    }

    /// Re-import secrets from the backup directory in the configuration.
    pub fn restore_all(&self) -> Result<RestoreReport> {
        let dir = self.configured_backup_dir()?.to_path_buf();
        self.restore(&dir)
    }
}

impl SecretProvider for LocalVault {
    fn get(&self, key: &str) -> Result<Secret> {
        let _guard = self.read_guard();
        self.store.get(key)
    }

    fn set(&self, key: &str, value: &str, options: WriteOptions) -> Result<Secret> {
        validate_key(key)?;

        if !options.allow_reserved {
            if let Some(reserved) = options
                .metadata
                .keys()
                .find(|name| is_reserved_metadata_key(name))
            {
                return Err(SecretError::Validation {
                    field: reserved.clone(),
                    reason: "metadata key is reserved for the store".into(),
                });
            }
        }

        let _guard = self.write_guard();

        let mut metadata = options.metadata;
        if let Some(name) = &options.schema {
            let schema = self.schemas.get(name)?;
            validate(&metadata, &schema)?;
            if let Some(expiry) = schema.expires_at(Utc::now()) {
                metadata.insert(META_EXPIRES_AT.to_string(), expiry.to_rfc3339());
            }
        }

        self.store
            .set(key, value, metadata, options.tags, options.schema)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_guard();
        self.store.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.read_guard();
        self.store.list(prefix)
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<Secret>> {
        let _guard = self.read_guard();
        search::scan(&self.store, query)
    }

    fn get_version(&self, key: &str, version: u32) -> Result<Secret> {
        let _guard = self.read_guard();
        self.store.get_version(key, version)
    }

    fn list_versions(&self, key: &str) -> Result<Vec<u32>> {
        let _guard = self.read_guard();
        self.store.list_versions(key)
    }

    fn rollback(&self, key: &str, version: u32) -> Result<Secret> {
        let _guard = self.write_guard();
        self.store.rollback(key, version)
    }

    fn rotate_key(&self) -> Result<()> {
        // Exclusive for the whole re-encrypt + swap, not just the swap: a
        // concurrent set during re-encryption could land under the old key
        // after its neighbors moved to the new one.
        let _guard = self.write_guard();
        self.rotator().rotate()
    }

    fn rotate_value(
        &self,
        key: &str,
        generator: Option<&dyn ValueGenerator>,
    ) -> Result<ValueRotation> {
        let _guard = self.write_guard();
        rotation::rotate_value(&self.store, key, generator)
    }

    fn set_rotation_policy(&self, key: &str, policy: RotationPolicy) -> Result<()> {
        let _guard = self.write_guard();
        rotation::set_policy(&self.store, key, &policy)
    }

    fn get_rotation_policy(&self, key: &str) -> Result<RotationPolicy> {
        let _guard = self.read_guard();
        rotation::get_policy(&self.store, key)
    }

    fn backup(&self, dir: &Path) -> Result<BackupReport> {
        let _guard = self.read_guard();

        std::fs::create_dir_all(dir)?;
        let mut report = BackupReport::default();

        for key in self.store.list("")? {
            match self.store.get(&key).and_then(|secret| {
                let path = export_path(dir, &key);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let json = serde_json::to_vec_pretty(&secret)?;
                std::fs::write(&path, json)?;
                Ok(())
            }) {
                Ok(()) => report.exported.push(key),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to export secret");
                    report.failures.push(BatchFailure {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            exported = report.exported.len(),
            failed = report.failures.len(),
            dir = %dir.display(),
            "backup complete"
        );
        Ok(report)
    }

    fn restore(&self, dir: &Path) -> Result<RestoreReport> {
        let _guard = self.write_guard();

        let mut files = Vec::new();
        collect_json_files(dir, &mut files)?;

        let mut report = RestoreReport::default();
        for path in files {
            let outcome = std::fs::read(&path)
                .map_err(SecretError::from)
                .and_then(|data| Ok(serde_json::from_slice::<Secret>(&data)?))
                .and_then(|secret| {
                    validate_key(&secret.key)?;
                    // Re-imports are ordinary versioned writes; restored
                    // metadata keeps its reserved keys (rotation state,
                    // provenance) intact.
                    self.store.set(
                        &secret.key,
                        &secret.value,
                        secret.metadata.clone(),
                        secret.tags.clone(),
                        secret.schema.clone(),
                    )?;
                    Ok(secret.key)
                });

            match outcome {
                Ok(key) => report.restored.push(key),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "failed to restore secret");
                    report.failures.push(BatchFailure {
                        key: path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            failed = report.failures.len(),
            dir = %dir.display(),
            "restore complete"
        );
        Ok(report)
    }
}

/// `<dir>/<key>.json`, with the key's slashes as subdirectories.
fn export_path(dir: &Path, key: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    let mut segments = key.split('/').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_some() {
            path.push(segment);
        } else {
            path.push(format!("{segment}.json"));
        }
    }
    path
}

/// Recursively collect `.json` files under `dir`.
fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}
