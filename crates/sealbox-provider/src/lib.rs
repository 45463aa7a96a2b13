//! Backend-agnostic secret provider contract for Sealbox.
//!
//! This crate defines the capability set every secret backend implements —
//! get, set, delete, list, search, version history, rollback, rotation,
//! backup and restore — together with the record types and the unified
//! error taxonomy those operations share.  The locally-encrypted engine
//! lives in `sealbox-vault`; remote adapters implement the same
//! [`SecretProvider`] trait against their native APIs.
//!
//! # Modules
//!
//! - [`provider`] — the [`SecretProvider`] trait, search queries, batch
//!   reports.
//! - [`secret`] — the [`Secret`] record, key validation, reserved metadata.
//! - [`rotation`] — value-rotation policies and the generator capability.
//! - [`sharing`] — cross-provider share / sync / revoke.
//! - [`error`] — unified error type.

pub mod error;
pub mod provider;
pub mod rotation;
pub mod secret;
pub mod sharing;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{BatchFailure, Result, SecretError};
pub use provider::{
    BackupReport, RestoreReport, SearchQuery, SecretProvider, SortField, SortOrder, ValueRotation,
};
pub use rotation::{CharacterSet, RotationPolicy, ValueGenerator};
pub use secret::{RESERVED_METADATA_KEYS, Secret, WriteOptions};
