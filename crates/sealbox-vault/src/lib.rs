//! Locally-encrypted secret engine for Sealbox.
//!
//! This crate is the reference implementation of the `sealbox-provider`
//! contract: a filesystem-backed store where every secret record is sealed
//! with AES-256-GCM under a master key held in the platform keychain.  It
//! provides versioned history with rollback, master-key rotation with a
//! crash-recovery journal, scheduled value rotation, schema validation and
//! metadata search.
//!
//! # Modules
//!
//! - [`crypto`] — AES-256-GCM sealing, PBKDF2 derivation, CSPRNG helpers.
//! - [`keychain`] — named master-key custody (OS keychain or sealed files).
//! - [`local`] — the [`LocalVault`] engine implementing `SecretProvider`.
//! - [`schema`] — named field-validation schemas.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sealbox_provider::{SecretProvider, WriteOptions};
//! use sealbox_vault::{LocalVault, LocalVaultConfig};
//!
//! # fn example() -> sealbox_provider::Result<()> {
//! let vault = LocalVault::open(LocalVaultConfig::new("data/sealbox"))?;
//!
//! vault.set("app/db/password", "p@ss1", WriteOptions::default())?;
//! let secret = vault.get("app/db/password")?;
//! assert_eq!(secret.version, 1);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod keychain;
pub mod local;
pub mod schema;

mod record;
mod rotation;
mod search;
mod store;

// Re-export the most commonly used types at the crate root for convenience.
pub use keychain::{FileKeychain, Keychain, platform_keychain};
pub use local::{LocalVault, LocalVaultConfig};
pub use schema::{Field, FieldType, Schema};
pub use sealbox_provider::{Result, SecretError};

#[cfg(target_os = "macos")]
pub use keychain::MacOSKeychain;
