//! Value-rotation policy types.
//!
//! A [`RotationPolicy`] describes the scheduled regeneration of a secret's
//! *value* (the master-key rotation that re-encrypts the whole corpus is an
//! engine concern and has no per-secret policy).  Policies are serialized as
//! JSON into the secret's reserved `rotation_policy` metadata key, so they
//! travel with the secret through versioning, backup and restore.
//!
//! Custom generation logic cannot be durably serialized, so it is modeled as
//! a capability: the caller re-supplies a [`ValueGenerator`] per rotation
//! invocation, and the persisted policy only carries the parameters of the
//! default character-set generator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Character sets for the default rotation value generator.
///
/// An unrecognized set name deserializes to [`Alphanumeric`], so a policy
/// written by a newer version with an unknown set still rotates rather than
/// failing.
///
/// [`Alphanumeric`]: CharacterSet::Alphanumeric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CharacterSet {
    /// Digits `0-9`.
    Numeric,
    /// Lowercase hex digits `0-9a-f`.
    Hex,
    /// Printable ASCII, `!` through `~`.
    Ascii,
    /// `A-Za-z0-9` (the default).
    Alphanumeric,
}

impl CharacterSet {
    /// The bytes this set draws from.
    pub fn alphabet(&self) -> &'static [u8] {
        match self {
            Self::Numeric => b"0123456789",
            Self::Hex => b"0123456789abcdef",
            Self::Ascii => {
                b"!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~"
            }
            Self::Alphanumeric => {
                b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789"
            }
        }
    }

    /// The canonical name stored in serialized policies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Hex => "hex",
            Self::Ascii => "ascii",
            Self::Alphanumeric => "alphanumeric",
        }
    }
}

impl Default for CharacterSet {
    fn default() -> Self {
        Self::Alphanumeric
    }
}

impl From<String> for CharacterSet {
    fn from(s: String) -> Self {
        match s.as_str() {
            "numeric" => Self::Numeric,
            "hex" => Self::Hex,
            "ascii" => Self::Ascii,
            // Unrecognized names fall back to the default set.
            _ => Self::Alphanumeric,
        }
    }
}

impl From<CharacterSet> for String {
    fn from(set: CharacterSet) -> Self {
        set.as_str().to_string()
    }
}

impl std::fmt::Display for CharacterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduled value-regeneration policy attached to a secret.
///
/// Invariant maintained by the rotation engine: after every successful
/// rotation, `next_rotation == last_rotation + interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Seconds between rotations.
    pub interval_secs: u64,

    /// Length of generated values, in characters.
    pub length: usize,

    /// Character set for the default generator.
    #[serde(default)]
    pub character_set: CharacterSet,

    /// When the value was last rotated.
    pub last_rotation: DateTime<Utc>,

    /// Due date: rotation before this instant is a no-op.
    pub next_rotation: DateTime<Utc>,
}

impl RotationPolicy {
    /// Build a policy whose first rotation is due one `interval` from now.
    pub fn new(interval: Duration, length: usize, character_set: CharacterSet) -> Self {
        let now = Utc::now();
        Self {
            interval_secs: interval.num_seconds().max(0) as u64,
            length,
            character_set,
            last_rotation: now,
            next_rotation: now + interval,
        }
    }

    /// The rotation interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs as i64)
    }

    /// Whether a rotation is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_rotation
    }

    /// Record a rotation at `now`, advancing the due date by one interval.
    pub fn mark_rotated(&mut self, now: DateTime<Utc>) {
        self.last_rotation = now;
        self.next_rotation = now + self.interval();
    }
}

/// A caller-supplied secret-value generator.
///
/// Supplied per rotation invocation; never persisted.  Any
/// `Fn() -> Result<String>` closure qualifies.
pub trait ValueGenerator {
    /// Produce a new secret value.
    fn generate(&self) -> Result<String>;
}

impl<F> ValueGenerator for F
where
    F: Fn() -> Result<String>,
{
    fn generate(&self) -> Result<String> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_character_set_falls_back_to_alphanumeric() {
        let set: CharacterSet = serde_json::from_str("\"base58\"").unwrap();
        assert_eq!(set, CharacterSet::Alphanumeric);

        let set: CharacterSet = serde_json::from_str("\"hex\"").unwrap();
        assert_eq!(set, CharacterSet::Hex);
    }

    #[test]
    fn character_set_roundtrip() {
        for set in [
            CharacterSet::Numeric,
            CharacterSet::Hex,
            CharacterSet::Ascii,
            CharacterSet::Alphanumeric,
        ] {
            let json = serde_json::to_string(&set).unwrap();
            let back: CharacterSet = serde_json::from_str(&json).unwrap();
            assert_eq!(back, set);
        }
    }

    #[test]
    fn ascii_alphabet_is_printable_range() {
        let alphabet = CharacterSet::Ascii.alphabet();
        assert_eq!(alphabet.len(), 94);
        assert_eq!(*alphabet.first().unwrap(), b'!');
        assert_eq!(*alphabet.last().unwrap(), b'~');
    }

    #[test]
    fn policy_due_date_tracks_interval() {
        let mut policy = RotationPolicy::new(Duration::hours(24), 32, CharacterSet::Alphanumeric);
        assert!(!policy.is_due(Utc::now()));

        let later = Utc::now() + Duration::hours(25);
        assert!(policy.is_due(later));

        policy.mark_rotated(later);
        assert_eq!(policy.next_rotation, policy.last_rotation + policy.interval());
        assert!(!policy.is_due(later));
    }

    #[test]
    fn policy_json_roundtrip() {
        let policy = RotationPolicy::new(Duration::hours(1), 16, CharacterSet::Hex);
        let json = serde_json::to_string(&policy).unwrap();
        let back: RotationPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
        assert!(json.contains("\"hex\""));
    }

    #[test]
    fn closure_is_a_value_generator() {
        let generator = || Ok("fixed-value".to_string());
        assert_eq!(generator.generate().unwrap(), "fixed-value");
    }
}
