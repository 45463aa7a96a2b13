//! Provider error types.
//!
//! Every backend — the local encrypted engine and any remote adapter —
//! surfaces failures through [`SecretError`], the single error type returned
//! by every operation in the provider contract.  Each variant carries enough
//! context for callers to decide how to handle the failure without parsing
//! opaque strings.
//!
//! The taxonomy separates key *access* problems
//! ([`KeyNotFound`](SecretError::KeyNotFound),
//! [`KeyGenerationFailed`](SecretError::KeyGenerationFailed),
//! [`KeychainUnavailable`](SecretError::KeychainUnavailable) — possibly
//! transient, the caller may retry) from data *integrity* problems
//! ([`DecryptionFailed`](SecretError::DecryptionFailed) — never retried,
//! since a retry cannot fix a wrong key or a corrupted blob).

/// A single failed item inside a batch operation.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// The secret key that failed.
    pub key: String,
    /// Why it failed.
    pub reason: String,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

/// Unified error type for all Sealbox providers.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    // -- Not-found errors ---------------------------------------------------
    /// The requested secret does not exist.
    #[error("secret not found: {key}")]
    SecretNotFound { key: String },

    /// The requested version is absent from the secret's history.
    #[error("version {version} not found for secret {key}")]
    VersionNotFound { key: String, version: u32 },

    /// The referenced schema does not exist.
    #[error("schema not found: {name}")]
    SchemaNotFound { name: String },

    // -- Validation errors --------------------------------------------------
    /// A field violated its schema constraint, or an input was malformed.
    /// Always names the offending field.
    #[error("validation failed for field {field}: {reason}")]
    Validation { field: String, reason: String },

    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, AEAD internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed: wrong key, tampered ciphertext, or truncated data.
    /// Non-recoverable for the affected record.
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    // -- Key custody errors -------------------------------------------------
    /// The named key is absent from the platform keychain.
    #[error("key not found in keychain: {name}")]
    KeyNotFound { name: String },

    /// Generating or storing a key in the keychain failed.
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed { reason: String },

    /// The keychain backend is unavailable (locked session, missing service).
    /// May be transient; the caller may retry.
    #[error("keychain unavailable: {reason}")]
    KeychainUnavailable { reason: String },

    // -- Rotation errors ----------------------------------------------------
    /// A master-key rotation journal is already present; the previous
    /// rotation must be resumed or aborted before a new one starts.
    #[error("master-key rotation already in progress")]
    RotationInProgress,

    /// The secret has no rotation policy attached.
    #[error("no rotation policy for secret {key}")]
    RotationPolicyMissing { key: String },

    // -- Contract errors ----------------------------------------------------
    /// The backend does not support this operation natively and does not
    /// emulate it.  Adapters must return this rather than silently dropping
    /// the guarantee.
    #[error("operation not supported by this backend: {operation}")]
    Unsupported { operation: &'static str },

    /// A batch operation (rotation, cleanup, restore) completed with some
    /// items failed.  Always carries every failed key and its cause.
    #[error("batch operation completed with {} failure(s)", .failures.len())]
    PartialFailure { failures: Vec<BatchFailure> },

    // -- Underlying errors --------------------------------------------------
    /// JSON serialization/deserialization error (also covers corrupt stored
    /// records that decrypt cleanly but no longer parse).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SecretError {
    /// True for errors that mark a stored record as unreadable garbage:
    /// decryption/authentication failures and parse failures.  Cleanup
    /// treats these as deletion triggers; everything else is left alone.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SecretError::DecryptionFailed { .. } | SecretError::Serialization(_)
        )
    }
}

/// Convenience alias used throughout the Sealbox crates.
pub type Result<T> = std::result::Result<T, SecretError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_counts_items() {
        let err = SecretError::PartialFailure {
            failures: vec![
                BatchFailure {
                    key: "app/a".into(),
                    reason: "decryption failed".into(),
                },
                BatchFailure {
                    key: "app/b".into(),
                    reason: "io error".into(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "batch operation completed with 2 failure(s)"
        );
    }

    #[test]
    fn corruption_classification() {
        let decrypt = SecretError::DecryptionFailed {
            reason: "bad tag".into(),
        };
        assert!(decrypt.is_corruption());

        let custody = SecretError::KeyNotFound {
            name: "master".into(),
        };
        assert!(!custody.is_corruption());

        let missing = SecretError::SecretNotFound {
            key: "app/db".into(),
        };
        assert!(!missing.is_corruption());
    }
}
