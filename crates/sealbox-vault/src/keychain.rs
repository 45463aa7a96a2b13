//! Platform keychain custody of named master keys.
//!
//! The master encryption key must never be stored as plaintext on disk.
//! This module provides a [`Keychain`] trait that abstracts over
//! platform-specific secure storage backends:
//!
//! - **macOS**: Keychain Services via `security-framework`
//! - **Fallback**: File-based storage sealed under a device-derived key
//!
//! Keys are addressed by logical *name*.  The engine uses two names:
//! [`MASTER_KEY_NAME`] for the canonical corpus key and
//! [`PENDING_KEY_NAME`] transiently during master-key rotation.
//!
//! There is deliberately no caching: every call reaches the backing store,
//! so rotation correctness never depends on what a long-lived process holds
//! in memory.
//!
//! # Security Notes
//!
//! - The file-based fallback is a compromise: its device-derived key can be
//!   reconstructed by anyone with access to the same machine account.  A
//!   real OS keychain provides OS-protected storage.
//! - Key files are written with mode 0600 on Unix.

use std::path::{Path, PathBuf};

use sealbox_provider::error::{Result, SecretError};

use crate::crypto;

/// Name of the canonical master key.
pub const MASTER_KEY_NAME: &str = "master";

/// Name of the replacement key that exists only while a master-key rotation
/// is in flight.
pub const PENDING_KEY_NAME: &str = "master_new";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Secure storage of named symmetric keys.
///
/// Implementations must be `Send + Sync` so one keychain can back a shared
/// engine.
pub trait Keychain: Send + Sync {
    /// Create (or replace) the named key with 32 fresh random bytes.
    ///
    /// Fails with [`SecretError::KeyGenerationFailed`] when the backing
    /// store rejects the write (e.g. locked session).
    fn generate(&self, name: &str) -> Result<()>;

    /// Fetch the named key's bytes.
    ///
    /// Fails with [`SecretError::KeyNotFound`] when absent.
    fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Remove the named key.  Removing an absent key is a no-op.
    fn delete(&self, name: &str) -> Result<()>;

    /// Move a key from `old` to `new`.
    ///
    /// Backends built on separate store/delete calls are NOT atomic across
    /// the steps; a crash can leave both or neither name present.  The
    /// rotation engine tolerates this via its journal.
    fn rename(&self, old: &str, new: &str) -> Result<()>;

    /// Whether the named key is present.
    fn exists(&self, name: &str) -> Result<bool>;
}

/// Key names are used as file names / keychain accounts, so keep them to a
/// single flat namespace.
fn validate_key_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(SecretError::Validation {
            field: "key_name".into(),
            reason: format!("invalid key name: {name:?}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// File-based fallback
// ---------------------------------------------------------------------------

/// Application salt mixed into the device-derived key.  Changing this
/// invalidates every previously stored key file.  Exactly 32 bytes.
const APP_SALT: &[u8; 32] = b"sealbox-keychain-device-key-v1\x00\x00";

/// File-based keychain that stores each named key in `<dir>/<name>.key`,
/// sealed under a key derived from machine-specific data.
pub struct FileKeychain {
    /// Directory holding the sealed key files.
    dir: PathBuf,
}

impl FileKeychain {
    /// Create a file-based keychain rooted at `dir`.  The directory is
    /// created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    /// Derive the sealing key from hostname, username and the application
    /// salt.  Deterministic per machine/user combination.
    fn device_derived_key(&self) -> [u8; crypto::KEY_LEN] {
        let hostname = Self::hostname();
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".into());

        let mut material = Vec::with_capacity(hostname.len() + username.len() + APP_SALT.len());
        material.extend_from_slice(hostname.as_bytes());
        material.extend_from_slice(username.as_bytes());
        material.extend_from_slice(APP_SALT);

        let mut key = [0u8; crypto::KEY_LEN];
        crypto::derive_key_with_salt(&material, APP_SALT, &mut key);
        key
    }

    /// Best-effort hostname lookup without a libc dependency.
    fn hostname() -> String {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .or_else(|_| std::env::var("HOSTNAME"))
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown-host".into())
        }

        #[cfg(not(unix))]
        {
            std::env::var("COMPUTERNAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "unknown-host".into())
        }
    }

    fn store(&self, name: &str, key: &[u8]) -> Result<()> {
        let device_key = self.device_derived_key();
        let sealed = crypto::seal(&device_key, key)?;

        std::fs::create_dir_all(&self.dir).map_err(|e| SecretError::KeyGenerationFailed {
            reason: format!("failed to create keychain directory: {e}"),
        })?;

        let path = self.key_path(name);
        std::fs::write(&path, &sealed).map_err(|e| SecretError::KeyGenerationFailed {
            reason: format!("failed to write key file: {e}"),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        tracing::info!(name = name, "stored key in file keychain");
        Ok(())
    }
}

impl Keychain for FileKeychain {
    fn generate(&self, name: &str) -> Result<()> {
        validate_key_name(name)?;
        let key = crypto::random_bytes(crypto::KEY_LEN)?;
        self.store(name, &key)
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_key_name(name)?;
        let path = self.key_path(name);
        if !path.exists() {
            return Err(SecretError::KeyNotFound { name: name.into() });
        }

        let sealed = std::fs::read(&path)?;
        let device_key = self.device_derived_key();
        let key = crypto::open(&device_key, &sealed)?;

        tracing::debug!(name = name, "retrieved key from file keychain");
        Ok(key)
    }

    fn delete(&self, name: &str) -> Result<()> {
        validate_key_name(name)?;
        let path = self.key_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(name = name, "deleted key from file keychain");
        }
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_key_name(old)?;
        validate_key_name(new)?;
        let old_path = self.key_path(old);
        if !old_path.exists() {
            return Err(SecretError::KeyNotFound { name: old.into() });
        }
        std::fs::rename(&old_path, self.key_path(new))?;
        tracing::info!(old = old, new = new, "renamed key in file keychain");
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        validate_key_name(name)?;
        Ok(self.key_path(name).exists())
    }
}

// ---------------------------------------------------------------------------
// macOS Keychain Services
// ---------------------------------------------------------------------------

/// The Security framework error code for "item not found"
/// (`errSecItemNotFound = -25300`).
#[cfg(target_os = "macos")]
const MACOS_ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// macOS Keychain Services integration via the `security-framework` crate.
///
/// Each named key is a generic password entry under a shared service name
/// with the key name as the account.
#[cfg(target_os = "macos")]
pub struct MacOSKeychain {
    /// The keychain service name (e.g. "io.sealbox.vault").
    service_name: String,
}

#[cfg(target_os = "macos")]
impl MacOSKeychain {
    /// Default service name used for keychain entries.
    const DEFAULT_SERVICE: &'static str = "io.sealbox.vault";

    /// Create a provider using the default service name.
    pub fn new() -> Self {
        Self {
            service_name: Self::DEFAULT_SERVICE.to_string(),
        }
    }

    /// Create a provider with a custom service name.  Useful for tests or
    /// multiple engines that must not share keychain entries.
    pub fn with_service(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
        }
    }

    fn set(&self, name: &str, key: &[u8]) -> Result<()> {
        use security_framework::passwords::set_generic_password;

        set_generic_password(&self.service_name, name, key).map_err(|e| {
            SecretError::KeyGenerationFailed {
                reason: format!("macOS keychain write failed: {e}"),
            }
        })
    }
}

#[cfg(target_os = "macos")]
impl Default for MacOSKeychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
impl Keychain for MacOSKeychain {
    fn generate(&self, name: &str) -> Result<()> {
        validate_key_name(name)?;
        let key = crypto::random_bytes(crypto::KEY_LEN)?;
        self.set(name, &key)?;
        tracing::info!(name = name, service = %self.service_name, "generated key in macOS keychain");
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        use security_framework::passwords::get_generic_password;

        validate_key_name(name)?;
        match get_generic_password(&self.service_name, name) {
            Ok(data) => {
                tracing::debug!(name = name, "retrieved key from macOS keychain");
                Ok(data.to_vec())
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => {
                Err(SecretError::KeyNotFound { name: name.into() })
            }
            Err(e) => Err(SecretError::KeychainUnavailable {
                reason: format!("macOS keychain read failed: {e}"),
            }),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        use security_framework::passwords::delete_generic_password;

        validate_key_name(name)?;
        match delete_generic_password(&self.service_name, name) {
            Ok(()) => {
                tracing::info!(name = name, "deleted key from macOS keychain");
                Ok(())
            }
            // Deleting an absent key is a no-op.
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(SecretError::KeychainUnavailable {
                reason: format!("macOS keychain delete failed: {e}"),
            }),
        }
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        // Three separate keychain calls; a crash in between can leave both
        // names present.  The rotation journal makes that recoverable.
        let key = self.get(old)?;
        self.set(new, &key)?;
        self.delete(old)?;
        tracing::info!(old = old, new = new, "renamed key in macOS keychain");
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        use security_framework::passwords::get_generic_password;

        validate_key_name(name)?;
        match get_generic_password(&self.service_name, name) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(false),
            Err(e) => Err(SecretError::KeychainUnavailable {
                reason: format!("macOS keychain check failed: {e}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Returns the best available keychain for the current platform.
///
/// - **macOS**: [`MacOSKeychain`] (Keychain Services)
/// - **Other platforms**: [`FileKeychain`] rooted at `key_dir`
///
/// On macOS `key_dir` is unused; it is part of the signature so callers have
/// a uniform construction path across platforms.
pub fn platform_keychain(key_dir: &Path) -> Box<dyn Keychain> {
    let _ = &key_dir;

    #[cfg(target_os = "macos")]
    {
        tracing::info!("using macOS Keychain Services for master key custody");
        Box::new(MacOSKeychain::new())
    }
    #[cfg(not(target_os = "macos"))]
    {
        tracing::info!(dir = %key_dir.display(), "using file-based keychain for master key custody");
        Box::new(FileKeychain::new(key_dir))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
