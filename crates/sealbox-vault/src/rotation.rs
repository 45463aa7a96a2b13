//! The two rotation engines: master-key rotation and value rotation.
//!
//! **Master-key rotation** re-encrypts the whole corpus under a freshly
//! generated key and then swaps key names (`master_new` → `master`).  The
//! keychain swap is not atomic, so a journal file is persisted *before* any
//! record is touched: it names the new key and accumulates the list of
//! already re-encrypted keys.  After a crash the journal lets
//! [`KeyRotator::resume`] finish the rotation — or [`KeyRotator::abort`]
//! roll it back — instead of leaving a split-key corpus.
//!
//! **Value rotation** regenerates one secret's *value* according to its
//! [`RotationPolicy`], carried in the secret's reserved `rotation_policy`
//! metadata.  It is triggered explicitly; before the policy's due date it is
//! a no-op.  Each rotation is an ordinary versioned write, so the previous
//! value stays reachable both through `previous_value` metadata and through
//! the version log.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sealbox_provider::error::{BatchFailure, Result, SecretError};
use sealbox_provider::provider::ValueRotation;
use sealbox_provider::rotation::{RotationPolicy, ValueGenerator};
use sealbox_provider::secret::{
    META_LAST_ROTATION, META_NEXT_ROTATION, META_PREVIOUS_VALUE, META_ROTATION_POLICY,
};

use crate::crypto;
use crate::keychain::{Keychain, MASTER_KEY_NAME, PENDING_KEY_NAME};
use crate::store::RecordStore;

// ---------------------------------------------------------------------------
// Master-key rotation
// ---------------------------------------------------------------------------

/// Durable progress marker for an in-flight master-key rotation.
///
/// Contains only key *names*, never key material, so it is stored as plain
/// JSON next to the secrets tree.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RotationJournal {
    /// Name of the replacement key records are being moved to.
    pub new_key: String,
    /// When the rotation started.
    pub started_at: DateTime<Utc>,
    /// Keys whose records are already sealed under `new_key`.
    pub reencrypted: Vec<String>,
}

/// Drives master-key rotation over a record store and keychain.
pub(crate) struct KeyRotator<'a> {
    store: &'a RecordStore,
    keychain: &'a dyn Keychain,
    journal_path: PathBuf,
}

impl<'a> KeyRotator<'a> {
    pub fn new(store: &'a RecordStore, keychain: &'a dyn Keychain, journal_path: PathBuf) -> Self {
        Self {
            store,
            keychain,
            journal_path,
        }
    }

    /// Re-encrypt every record under a new master key and swap it in.
    ///
    /// Per-record failures are skipped and reported together as
    /// [`SecretError::PartialFailure`]; the swap still happens, so failed
    /// records become unreadable and are left for cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::RotationInProgress`] when a journal from an
    /// earlier rotation exists; resolve it with [`resume`](Self::resume) or
    /// [`abort`](Self::abort) first.
    pub fn rotate(&self) -> Result<()> {
        if self.journal_path.exists() {
            return Err(SecretError::RotationInProgress);
        }

        let keys = self.store.list("")?;
        tracing::info!(count = keys.len(), "starting master-key rotation");

        // Decrypt the whole corpus under the old key up front, so a record
        // that cannot be read never blocks the ones that can.
        let mut records = Vec::with_capacity(keys.len());
        let mut failures = Vec::new();
        for key in keys {
            match self.store.load(&key) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping record in key rotation");
                    failures.push(BatchFailure {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // A pending key without a journal is a leftover from a crash before
        // any record moved; replace it.
        if self.keychain.exists(PENDING_KEY_NAME)? {
            self.keychain.delete(PENDING_KEY_NAME)?;
        }
        self.keychain.generate(PENDING_KEY_NAME)?;

        let mut journal = RotationJournal {
            new_key: PENDING_KEY_NAME.to_string(),
            started_at: Utc::now(),
            reencrypted: Vec::new(),
        };
        self.write_journal(&journal)?;

        for record in &records {
            match self.store.save_as(record, PENDING_KEY_NAME) {
                Ok(()) => {
                    journal.reencrypted.push(record.key.clone());
                    self.write_journal(&journal)?;
                }
                Err(e) => {
                    tracing::warn!(key = %record.key, error = %e, "failed to re-encrypt record");
                    failures.push(BatchFailure {
                        key: record.key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.swap()?;
        self.clear_journal()?;

        if failures.is_empty() {
            tracing::info!("master-key rotation complete");
            Ok(())
        } else {
            tracing::warn!(failed = failures.len(), "master-key rotation partially failed");
            Err(SecretError::PartialFailure { failures })
        }
    }

    /// Finish a rotation interrupted by a crash, using the journal.
    ///
    /// A no-op when no journal is present.
    pub fn resume(&self) -> Result<()> {
        let Some(mut journal) = self.try_read_journal()? else {
            tracing::debug!("no rotation journal, nothing to resume");
            return Ok(());
        };

        let pending = self.keychain.exists(PENDING_KEY_NAME)?;
        let master = self.keychain.exists(MASTER_KEY_NAME)?;
        tracing::info!(
            reencrypted = journal.reencrypted.len(),
            pending_key = pending,
            master_key = master,
            "resuming master-key rotation"
        );

        if !pending {
            if !master {
                // Both names gone: the corpus cannot be read with what the
                // keychain holds.  Operator intervention required.
                return Err(SecretError::KeychainUnavailable {
                    reason: "neither master nor pending key present during resume".into(),
                });
            }
            // The rename completed; only the journal cleanup was lost.
            self.clear_journal()?;
            return Ok(());
        }

        if !master {
            // Crashed between delete(master) and the rename.  The delete only
            // happens after every record moved, so just finish the swap.
            self.keychain.rename(PENDING_KEY_NAME, MASTER_KEY_NAME)?;
            self.clear_journal()?;
            return Ok(());
        }

        // Mid re-encryption: move the remaining records.
        let mut failures = Vec::new();
        for key in self.store.list("")? {
            if journal.reencrypted.contains(&key) {
                continue;
            }
            match self.store.load(&key) {
                Ok(record) => match self.store.save_as(&record, PENDING_KEY_NAME) {
                    Ok(()) => {
                        journal.reencrypted.push(key);
                        self.write_journal(&journal)?;
                    }
                    Err(e) => failures.push(BatchFailure {
                        key,
                        reason: e.to_string(),
                    }),
                },
                Err(SecretError::DecryptionFailed { .. }) => {
                    // Possibly already under the new key but the journal
                    // write was lost; verify before giving up on it.
                    match self.store.load_as(&key, PENDING_KEY_NAME) {
                        Ok(_) => {
                            journal.reencrypted.push(key);
                            self.write_journal(&journal)?;
                        }
                        Err(e) => {
                            tracing::warn!(key = %key, error = %e, "record unreadable under either key");
                            failures.push(BatchFailure {
                                key,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => failures.push(BatchFailure {
                    key,
                    reason: e.to_string(),
                }),
            }
        }

        self.swap()?;
        self.clear_journal()?;

        if failures.is_empty() {
            tracing::info!("master-key rotation resumed to completion");
            Ok(())
        } else {
            Err(SecretError::PartialFailure { failures })
        }
    }

    /// Roll an interrupted rotation back: re-encrypt journaled records under
    /// the old master key and discard the pending key.
    ///
    /// Only possible while the old `master` key still exists (i.e. the swap
    /// has not happened); afterwards the only way forward is
    /// [`resume`](Self::resume).
    pub fn abort(&self) -> Result<()> {
        let Some(journal) = self.try_read_journal()? else {
            tracing::debug!("no rotation journal, nothing to abort");
            return Ok(());
        };

        if !self.keychain.exists(MASTER_KEY_NAME)? {
            // The old key is gone; rolling back is impossible.
            return Err(SecretError::KeyNotFound {
                name: MASTER_KEY_NAME.into(),
            });
        }
        if !self.keychain.exists(PENDING_KEY_NAME)? {
            // Journal exists but the pending key is gone: the swap already
            // renamed it onto master, too late to roll back.
            return Err(SecretError::KeyNotFound {
                name: PENDING_KEY_NAME.into(),
            });
        }

        tracing::info!(
            reencrypted = journal.reencrypted.len(),
            "aborting master-key rotation"
        );

        let mut failures = Vec::new();
        for key in &journal.reencrypted {
            match self.store.load_as(key, PENDING_KEY_NAME) {
                Ok(record) => {
                    if let Err(e) = self.store.save(&record) {
                        failures.push(BatchFailure {
                            key: key.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                Err(e) => failures.push(BatchFailure {
                    key: key.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            // Keep the journal and the pending key so the records that did
            // not move back stay reachable for a retry.
            return Err(SecretError::PartialFailure { failures });
        }

        self.keychain.delete(PENDING_KEY_NAME)?;
        self.clear_journal()?;
        tracing::info!("master-key rotation aborted");
        Ok(())
    }

    /// Retire the old key and promote the new one.
    fn swap(&self) -> Result<()> {
        self.keychain.delete(MASTER_KEY_NAME)?;
        self.keychain.rename(PENDING_KEY_NAME, MASTER_KEY_NAME)?;
        Ok(())
    }

    // -- Journal I/O --------------------------------------------------------

    fn write_journal(&self, journal: &RotationJournal) -> Result<()> {
        let json = serde_json::to_vec_pretty(journal)?;
        std::fs::write(&self.journal_path, json)?;
        Ok(())
    }

    fn try_read_journal(&self) -> Result<Option<RotationJournal>> {
        if !self.journal_path.is_file() {
            return Ok(None);
        }
        let data = std::fs::read(&self.journal_path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn clear_journal(&self) -> Result<()> {
        if self.journal_path.exists() {
            std::fs::remove_file(&self.journal_path)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Value rotation
// ---------------------------------------------------------------------------

/// Regenerate a secret's value if its policy says it is due.
///
/// `generator` overrides the policy's default character-set generator for
/// this invocation only; it is a capability and is never persisted.
pub(crate) fn rotate_value(
    store: &RecordStore,
    key: &str,
    generator: Option<&dyn ValueGenerator>,
) -> Result<ValueRotation> {
    let record = store.load(key)?;
    let entry = record.current().expect("verified record is non-empty");

    let policy_json = entry
        .metadata
        .get(META_ROTATION_POLICY)
        .ok_or_else(|| SecretError::RotationPolicyMissing { key: key.into() })?;
    let mut policy: RotationPolicy = serde_json::from_str(policy_json)?;

    let now = Utc::now();
    if !policy.is_due(now) {
        tracing::debug!(key = key, next_rotation = %policy.next_rotation, "value rotation not due");
        return Ok(ValueRotation::NotDue {
            next_rotation: policy.next_rotation,
        });
    }

    let new_value = match generator {
        Some(g) => g.generate()?,
        None => crypto::random_string(policy.length, policy.character_set)?,
    };

    policy.mark_rotated(now);

    let mut metadata = entry.metadata.clone();
    metadata.insert(META_PREVIOUS_VALUE.to_string(), entry.value.clone());
    metadata.insert(
        META_LAST_ROTATION.to_string(),
        policy.last_rotation.to_rfc3339(),
    );
    metadata.insert(
        META_NEXT_ROTATION.to_string(),
        policy.next_rotation.to_rfc3339(),
    );
    metadata.insert(
        META_ROTATION_POLICY.to_string(),
        serde_json::to_string(&policy)?,
    );

    let secret = store.set(
        key,
        &new_value,
        metadata,
        entry.tags.clone(),
        entry.schema.clone(),
    )?;

    tracing::info!(key = key, version = secret.version, "rotated secret value");
    Ok(ValueRotation::Rotated(secret))
}

/// Attach or replace the rotation policy on a secret (a versioned write).
pub(crate) fn set_policy(store: &RecordStore, key: &str, policy: &RotationPolicy) -> Result<()> {
    let record = store.load(key)?;
    let entry = record.current().expect("verified record is non-empty");

    let mut metadata = entry.metadata.clone();
    metadata.insert(
        META_ROTATION_POLICY.to_string(),
        serde_json::to_string(policy)?,
    );
    metadata.insert(
        META_LAST_ROTATION.to_string(),
        policy.last_rotation.to_rfc3339(),
    );
    metadata.insert(
        META_NEXT_ROTATION.to_string(),
        policy.next_rotation.to_rfc3339(),
    );

    store.set(
        key,
        &entry.value,
        metadata,
        entry.tags.clone(),
        entry.schema.clone(),
    )?;

    tracing::info!(key = key, interval_secs = policy.interval_secs, "set rotation policy");
    Ok(())
}

/// Read the rotation policy of a secret.
pub(crate) fn get_policy(store: &RecordStore, key: &str) -> Result<RotationPolicy> {
    let record = store.load(key)?;
    let entry = record.current().expect("verified record is non-empty");

    let policy_json = entry
        .metadata
        .get(META_ROTATION_POLICY)
        .ok_or_else(|| SecretError::RotationPolicyMissing { key: key.into() })?;
    Ok(serde_json::from_str(policy_json)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Duration;
    use sealbox_provider::rotation::CharacterSet;

    use crate::crypto::Cipher;
    use crate::keychain::FileKeychain;

    struct Fixture {
        dir: tempfile::TempDir,
        keychain: Arc<FileKeychain>,
        store: RecordStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let keychain = Arc::new(FileKeychain::new(dir.path().join("keys")));
            keychain.generate(MASTER_KEY_NAME).unwrap();
            let cipher = Cipher::new(keychain.clone());
            let store = RecordStore::new(dir.path().join("secrets"), cipher);
            Self {
                dir,
                keychain,
                store,
            }
        }

        fn rotator(&self) -> KeyRotator<'_> {
            KeyRotator::new(
                &self.store,
                self.keychain.as_ref(),
                self.dir.path().join("rotation.journal"),
            )
        }

        fn seed(&self, key: &str, value: &str) {
            self.store
                .set(key, value, BTreeMap::new(), vec![], None)
                .unwrap();
        }

        fn due_policy() -> RotationPolicy {
            let now = Utc::now();
            RotationPolicy {
                interval_secs: 86_400,
                length: 32,
                character_set: CharacterSet::Alphanumeric,
                last_rotation: now - Duration::hours(48),
                next_rotation: now - Duration::hours(24),
            }
        }
    }

    #[test]
    fn key_rotation_keeps_every_record_readable() {
        let fx = Fixture::new();
        fx.seed("app/a", "value-a");
        fx.seed("app/b", "value-b");
        fx.seed("deep/nested/c", "value-c");

        let old_key = fx.keychain.get(MASTER_KEY_NAME).unwrap();
        fx.rotator().rotate().unwrap();
        let new_key = fx.keychain.get(MASTER_KEY_NAME).unwrap();

        assert_ne!(old_key, new_key);
        assert!(!fx.keychain.exists(PENDING_KEY_NAME).unwrap());
        assert!(!fx.dir.path().join("rotation.journal").exists());

        assert_eq!(fx.store.get("app/a").unwrap().value, "value-a");
        assert_eq!(fx.store.get("app/b").unwrap().value, "value-b");
        assert_eq!(fx.store.get("deep/nested/c").unwrap().value, "value-c");
    }

    #[test]
    fn rotation_refused_while_journal_present() {
        let fx = Fixture::new();
        fx.seed("app/a", "v");

        std::fs::write(
            fx.dir.path().join("rotation.journal"),
            serde_json::to_vec(&RotationJournal {
                new_key: PENDING_KEY_NAME.into(),
                started_at: Utc::now(),
                reencrypted: vec![],
            })
            .unwrap(),
        )
        .unwrap();

        assert!(matches!(
            fx.rotator().rotate(),
            Err(SecretError::RotationInProgress)
        ));
    }

    #[test]
    fn unreadable_record_reported_as_partial_failure() {
        let fx = Fixture::new();
        fx.seed("app/good", "v");
        fx.seed("app/bad", "v");
        std::fs::write(fx.dir.path().join("secrets/app/bad"), b"garbage").unwrap();

        let err = fx.rotator().rotate().unwrap_err();
        let SecretError::PartialFailure { failures } = err else {
            panic!("expected PartialFailure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "app/bad");

        // The good record survived the swap.
        assert_eq!(fx.store.get("app/good").unwrap().value, "v");
    }

    #[test]
    fn resume_finishes_a_rotation_interrupted_mid_reencryption() {
        let fx = Fixture::new();
        fx.seed("app/a", "value-a");
        fx.seed("app/b", "value-b");

        // Manufacture the crash state: pending key generated, one record
        // moved, journal naming it, old key still canonical.
        fx.keychain.generate(PENDING_KEY_NAME).unwrap();
        let moved = fx.store.load("app/a").unwrap();
        fx.store.save_as(&moved, PENDING_KEY_NAME).unwrap();
        std::fs::write(
            fx.dir.path().join("rotation.journal"),
            serde_json::to_vec(&RotationJournal {
                new_key: PENDING_KEY_NAME.into(),
                started_at: Utc::now(),
                reencrypted: vec!["app/a".into()],
            })
            .unwrap(),
        )
        .unwrap();

        fx.rotator().resume().unwrap();

        assert!(!fx.keychain.exists(PENDING_KEY_NAME).unwrap());
        assert!(!fx.dir.path().join("rotation.journal").exists());
        assert_eq!(fx.store.get("app/a").unwrap().value, "value-a");
        assert_eq!(fx.store.get("app/b").unwrap().value, "value-b");
    }

    #[test]
    fn resume_finishes_an_interrupted_swap() {
        let fx = Fixture::new();
        fx.seed("app/a", "value-a");

        // Everything re-encrypted, crash between delete(master) and rename.
        fx.keychain.generate(PENDING_KEY_NAME).unwrap();
        let record = fx.store.load("app/a").unwrap();
        fx.store.save_as(&record, PENDING_KEY_NAME).unwrap();
        std::fs::write(
            fx.dir.path().join("rotation.journal"),
            serde_json::to_vec(&RotationJournal {
                new_key: PENDING_KEY_NAME.into(),
                started_at: Utc::now(),
                reencrypted: vec!["app/a".into()],
            })
            .unwrap(),
        )
        .unwrap();
        fx.keychain.delete(MASTER_KEY_NAME).unwrap();

        fx.rotator().resume().unwrap();

        assert!(fx.keychain.exists(MASTER_KEY_NAME).unwrap());
        assert_eq!(fx.store.get("app/a").unwrap().value, "value-a");
    }

    #[test]
    fn resume_without_journal_is_a_noop() {
        let fx = Fixture::new();
        fx.seed("app/a", "v");
        fx.rotator().resume().unwrap();
        assert_eq!(fx.store.get("app/a").unwrap().value, "v");
    }

    #[test]
    fn abort_restores_the_old_key_state() {
        let fx = Fixture::new();
        fx.seed("app/a", "value-a");
        fx.seed("app/b", "value-b");

        fx.keychain.generate(PENDING_KEY_NAME).unwrap();
        let moved = fx.store.load("app/a").unwrap();
        fx.store.save_as(&moved, PENDING_KEY_NAME).unwrap();
        std::fs::write(
            fx.dir.path().join("rotation.journal"),
            serde_json::to_vec(&RotationJournal {
                new_key: PENDING_KEY_NAME.into(),
                started_at: Utc::now(),
                reencrypted: vec!["app/a".into()],
            })
            .unwrap(),
        )
        .unwrap();

        fx.rotator().abort().unwrap();

        assert!(!fx.keychain.exists(PENDING_KEY_NAME).unwrap());
        assert!(!fx.dir.path().join("rotation.journal").exists());
        assert_eq!(fx.store.get("app/a").unwrap().value, "value-a");
        assert_eq!(fx.store.get("app/b").unwrap().value, "value-b");
    }

    #[test]
    fn value_rotation_is_a_noop_before_due_date() {
        let fx = Fixture::new();
        fx.seed("app/token", "initial");

        let policy = RotationPolicy::new(Duration::hours(24), 32, CharacterSet::Alphanumeric);
        set_policy(&fx.store, "app/token", &policy).unwrap();

        let outcome = rotate_value(&fx.store, "app/token", None).unwrap();
        assert!(matches!(outcome, ValueRotation::NotDue { .. }));

        let secret = fx.store.get("app/token").unwrap();
        assert_eq!(secret.value, "initial");
        assert!(!secret.metadata.contains_key(META_PREVIOUS_VALUE));
    }

    #[test]
    fn due_value_rotation_regenerates_and_tracks_previous() {
        let fx = Fixture::new();
        fx.seed("app/token", "initial");
        set_policy(&fx.store, "app/token", &Fixture::due_policy()).unwrap();

        let outcome = rotate_value(&fx.store, "app/token", None).unwrap();
        let ValueRotation::Rotated(secret) = outcome else {
            panic!("expected rotation");
        };

        assert_ne!(secret.value, "initial");
        assert_eq!(secret.value.len(), 32);
        assert!(secret.value.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(
            secret.metadata.get(META_PREVIOUS_VALUE).map(String::as_str),
            Some("initial")
        );

        // The policy invariant holds after rotation.
        let policy = get_policy(&fx.store, "app/token").unwrap();
        assert_eq!(
            policy.next_rotation,
            policy.last_rotation + policy.interval()
        );
    }

    #[test]
    fn character_sets_shape_generated_values() {
        let cases: [(CharacterSet, fn(char) -> bool); 3] = [
            (CharacterSet::Numeric, |c| c.is_ascii_digit()),
            (CharacterSet::Hex, |c| {
                c.is_ascii_digit() || ('a'..='f').contains(&c)
            }),
            (CharacterSet::Ascii, |c| ('!'..='~').contains(&c)),
        ];
        for (charset, check) in cases {
            let fx = Fixture::new();
            fx.seed("app/token", "initial");

            let mut policy = Fixture::due_policy();
            policy.character_set = charset;
            set_policy(&fx.store, "app/token", &policy).unwrap();

            let ValueRotation::Rotated(secret) =
                rotate_value(&fx.store, "app/token", None).unwrap()
            else {
                panic!("expected rotation");
            };
            assert_eq!(secret.value.len(), 32);
            assert!(secret.value.chars().all(check), "charset {charset} violated");
        }
    }

    #[test]
    fn custom_generator_overrides_charset() {
        let fx = Fixture::new();
        fx.seed("app/token", "initial");
        set_policy(&fx.store, "app/token", &Fixture::due_policy()).unwrap();

        let generator = || Ok("custom-generated-value".to_string());
        let ValueRotation::Rotated(secret) =
            rotate_value(&fx.store, "app/token", Some(&generator)).unwrap()
        else {
            panic!("expected rotation");
        };

        assert_eq!(secret.value, "custom-generated-value");
        assert_eq!(
            secret.metadata.get(META_PREVIOUS_VALUE).map(String::as_str),
            Some("initial")
        );
    }

    #[test]
    fn rotation_without_policy_is_an_error() {
        let fx = Fixture::new();
        fx.seed("app/token", "initial");

        assert!(matches!(
            rotate_value(&fx.store, "app/token", None),
            Err(SecretError::RotationPolicyMissing { .. })
        ));
        assert!(matches!(
            get_policy(&fx.store, "app/token"),
            Err(SecretError::RotationPolicyMissing { .. })
        ));
    }
}
