//! AES-256-GCM encryption and decryption using the `ring` crate.
//!
//! This module provides the cryptographic primitives for the vault:
//!
//! - **Sealing/opening**: AES-256-GCM authenticated encryption with a
//!   randomly generated 96-bit nonce per call, prepended to the output
//!   (`nonce || ciphertext+tag`).
//! - **Key derivation**: PBKDF2-HMAC-SHA256, used by the file-based
//!   keychain to derive its device key.
//! - **Random generation**: Cryptographically secure random bytes and
//!   rotation-value strings via `ring`'s `SystemRandom`.
//!
//! The [`Cipher`] wrapper implements the engine's encryption contract in
//! terms of *named* keys: key bytes are fetched from the keychain for the
//! duration of a single call and dropped afterwards — nothing here retains
//! key material.
//!
//! # Security Notes
//!
//! - Nonces are generated randomly for each sealing operation. With a
//!   96-bit nonce the collision probability is negligible for up to ~2^32
//!   encryptions under one key.
//! - Opening never attempts a partial decrypt: an input shorter than the
//!   nonce, a wrong key, or a failed authentication tag all return
//!   [`SecretError::DecryptionFailed`].

use std::sync::Arc;

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use sealbox_provider::error::{Result, SecretError};
use sealbox_provider::rotation::CharacterSet;

use crate::keychain::Keychain;

/// Length of an AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// PBKDF2 iteration count for the file-keychain device key.
const PBKDF2_ITERATIONS: u32 = 600_000;

/// PBKDF2 algorithm: HMAC-SHA256.
static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// AES-256-GCM algorithm from `ring`.
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations. Since a fresh
/// random nonce is generated per call, this wrapper ensures each bound key
/// is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Seal / open
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-GCM under the 256-bit `key`.
///
/// Returns `nonce || ciphertext+tag` in one buffer, ready to be written to
/// disk.
///
/// # Errors
///
/// Returns [`SecretError::EncryptionFailed`] if the key length is wrong or
/// `ring` reports a failure.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(SecretError::EncryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let rng = SystemRandom::new();

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| SecretError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key =
        UnboundKey::new(AEAD_ALG, key).map_err(|_| SecretError::EncryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        })?;

    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    // `ring` encrypts in-place and appends the authentication tag; the nonce
    // is prepended so a single buffer round-trips through `open`.
    let mut out = Vec::with_capacity(NONCE_LEN_BYTES + plaintext.len() + TAG_LEN);
    out.extend_from_slice(&nonce_bytes);
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| SecretError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;
    out.extend_from_slice(&in_out);

    tracing::trace!(
        plaintext_len = plaintext.len(),
        sealed_len = out.len(),
        "sealed data"
    );

    Ok(out)
}

/// Decrypt a `nonce || ciphertext+tag` buffer produced by [`seal`].
///
/// # Errors
///
/// Returns [`SecretError::DecryptionFailed`] if the input is shorter than
/// the nonce, the key is wrong, or the data has been tampered with.
pub fn open(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(SecretError::DecryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }
    if data.len() < NONCE_LEN_BYTES {
        return Err(SecretError::DecryptionFailed {
            reason: "input shorter than nonce".into(),
        });
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN_BYTES);
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    nonce.copy_from_slice(nonce_bytes);

    let unbound_key =
        UnboundKey::new(AEAD_ALG, key).map_err(|_| SecretError::DecryptionFailed {
            reason: "failed to create AES-256-GCM key".into(),
        })?;

    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| SecretError::DecryptionFailed {
            reason: "authentication failed: wrong key or corrupted data".into(),
        })?;

    let result = plaintext.to_vec();

    tracing::trace!(
        sealed_len = data.len(),
        plaintext_len = result.len(),
        "opened data"
    );

    Ok(result)
}

// ---------------------------------------------------------------------------
// Named-key cipher
// ---------------------------------------------------------------------------

/// Authenticated encryption in terms of keychain key *names*.
///
/// Every call looks the key up in the keychain afresh — there is no caching,
/// so master-key rotation is never defeated by stale key bytes held in
/// process memory.
#[derive(Clone)]
pub struct Cipher {
    keychain: Arc<dyn Keychain>,
}

impl Cipher {
    /// Create a cipher backed by the given keychain.
    pub fn new(keychain: Arc<dyn Keychain>) -> Self {
        Self { keychain }
    }

    /// Encrypt `plaintext` under the named key.
    pub fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.keychain.get(key_name)?;
        seal(&key, plaintext)
    }

    /// Decrypt a sealed buffer under the named key.
    pub fn decrypt(&self, key_name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.keychain.get(key_name)?;
        open(&key, data)
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from `material` and `salt` via PBKDF2-HMAC-SHA256.
///
/// Deterministic; used by the file keychain for its device-derived key.
pub fn derive_key_with_salt(material: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    let iterations =
        std::num::NonZeroU32::new(PBKDF2_ITERATIONS).expect("PBKDF2_ITERATIONS is non-zero");
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, material, out);
}

// ---------------------------------------------------------------------------
// Random generation
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`SecretError::KeyGenerationFailed`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| SecretError::KeyGenerationFailed {
            reason: "failed to generate random bytes".into(),
        })?;
    Ok(buf)
}

/// Generate a `len`-character string drawn uniformly from `charset`.
///
/// Uses rejection sampling so every character of the set is equally likely.
pub fn random_string(len: usize, charset: CharacterSet) -> Result<String> {
    let alphabet = charset.alphabet();
    // Largest multiple of the alphabet size that fits in a byte; bytes at or
    // above it are rejected to keep the draw unbiased.
    let limit = 256 - (256 % alphabet.len());

    let rng = SystemRandom::new();
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];

    while out.len() < len {
        rng.fill(&mut buf)
            .map_err(|_| SecretError::KeyGenerationFailed {
                reason: "failed to generate random bytes".into(),
            })?;
        for &byte in &buf {
            if (byte as usize) < limit {
                out.push(alphabet[byte as usize % alphabet.len()] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let plaintext = b"hello, sealbox!";

        let sealed = seal(&key, plaintext).unwrap();
        assert!(sealed.len() >= NONCE_LEN_BYTES + plaintext.len() + TAG_LEN);

        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let key1 = random_bytes(KEY_LEN).unwrap();
        let key2 = random_bytes(KEY_LEN).unwrap();

        let sealed = seal(&key1, b"secret data").unwrap();
        let result = open(&key2, &sealed);

        assert!(matches!(
            result,
            Err(SecretError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn open_tampered_data_fails() {
        let key = random_bytes(KEY_LEN).unwrap();
        let mut sealed = seal(&key, b"secret data").unwrap();

        // Flip a bit in the ciphertext region (past the nonce).
        sealed[NONCE_LEN_BYTES] ^= 0x01;

        let result = open(&key, &sealed);
        assert!(matches!(
            result,
            Err(SecretError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn open_truncated_input_fails() {
        let key = random_bytes(KEY_LEN).unwrap();
        let result = open(&key, &[0u8; NONCE_LEN_BYTES - 1]);
        assert!(matches!(
            result,
            Err(SecretError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short_key = vec![0u8; 16]; // AES-128, not AES-256
        assert!(seal(&short_key, b"test").is_err());
        assert!(open(&short_key, &[0u8; 40]).is_err());
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = random_bytes(KEY_LEN).unwrap();
        let sealed = seal(&key, b"").unwrap();
        let opened = open(&key, &sealed).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn pbkdf2_deterministic_with_same_salt() {
        let mut key1 = [0u8; KEY_LEN];
        let mut key2 = [0u8; KEY_LEN];
        derive_key_with_salt(b"material", b"salt", &mut key1);
        derive_key_with_salt(b"material", b"salt", &mut key2);
        assert_eq!(key1, key2);

        let mut key3 = [0u8; KEY_LEN];
        derive_key_with_salt(b"material", b"other-salt", &mut key3);
        assert_ne!(key1, key3);
    }

    #[test]
    fn random_string_respects_length_and_charset() {
        for (charset, check) in [
            (
                CharacterSet::Numeric,
                Box::new(|c: char| c.is_ascii_digit()) as Box<dyn Fn(char) -> bool>,
            ),
            (
                CharacterSet::Hex,
                Box::new(|c: char| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
            ),
            (
                CharacterSet::Ascii,
                Box::new(|c: char| ('!'..='~').contains(&c)),
            ),
            (
                CharacterSet::Alphanumeric,
                Box::new(|c: char| c.is_ascii_alphanumeric()),
            ),
        ] {
            let value = random_string(32, charset).unwrap();
            assert_eq!(value.len(), 32);
            assert!(value.chars().all(&check), "charset {charset} violated");
        }
    }

    #[test]
    fn random_strings_differ() {
        let a = random_string(32, CharacterSet::Alphanumeric).unwrap();
        let b = random_string(32, CharacterSet::Alphanumeric).unwrap();
        assert_ne!(a, b);
    }
}
