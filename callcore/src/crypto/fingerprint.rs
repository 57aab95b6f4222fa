//! Emoji rendering of the session-key hash.
//!
//! Both users read their four emoji to each other; a mismatch means the
//! signaling channel swapped keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;

const EMOJI_TABLES: [[&str; 10]; 4] = [
    ["🐶", "🐱", "🦊", "🐻", "🐼", "🐨", "🐯", "🦁", "🐮", "🐷"],
    ["🍎", "🍌", "🍇", "🍓", "🍒", "🍑", "🍍", "🥝", "🍋", "🍉"],
    ["🚗", "🚕", "🚌", "🚑", "🚒", "🚜", "🚲", "🛵", "🚀", "🚁"],
    ["⚽", "🏀", "🏈", "⚾", "🎾", "🏐", "🏉", "🎱", "🏓", "🏸"],
];

/// The four emoji derived from a session-key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFingerprint([&'static str; 4]);

impl KeyFingerprint {
    /// Derive from raw hash bytes (at least four).
    pub fn from_hash_bytes(hash: &[u8]) -> Option<Self> {
        if hash.len() < 4 {
            return None;
        }
        let mut out = [""; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = EMOJI_TABLES[i][(hash[i] % 10) as usize];
        }
        Some(Self(out))
    }

    /// Derive from the base64 hash carried in `call_session_key`.
    pub fn from_hash(hash_b64: &str) -> Option<Self> {
        let bytes = STANDARD.decode(hash_b64).ok()?;
        Self::from_hash_bytes(&bytes)
    }

    pub fn emoji(&self) -> [&'static str; 4] {
        self.0
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SessionKey, session_key_hash};

    #[test]
    fn test_indexes_each_table_mod_ten() {
        let fp = KeyFingerprint::from_hash_bytes(&[0, 11, 29, 255]).unwrap();
        assert_eq!(fp.emoji(), ["🐶", "🍌", "🛵", "🏉"]);
    }

    #[test]
    fn test_same_key_same_fingerprint() {
        let key = SessionKey::from_bytes([42u8; 32]);
        let a = KeyFingerprint::from_hash(&session_key_hash(&key)).unwrap();
        let b = KeyFingerprint::from_hash(&session_key_hash(&key.clone())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_keys_usually_differ() {
        // 10^4 fingerprints; across a handful of random keys a collision with
        // all of them is vanishingly unlikely.
        let reference = SessionKey::generate();
        let fp = KeyFingerprint::from_hash(&reference.hash()).unwrap();
        let differing = (0..8)
            .map(|_| SessionKey::generate())
            .filter(|k| KeyFingerprint::from_hash(&k.hash()).unwrap() != fp)
            .count();
        assert!(differing >= 7);
    }

    #[test]
    fn test_rejects_short_or_invalid_hash() {
        assert!(KeyFingerprint::from_hash_bytes(&[1, 2, 3]).is_none());
        assert!(KeyFingerprint::from_hash("not base64!").is_none());
    }

    #[test]
    fn test_display_joins_with_spaces() {
        let fp = KeyFingerprint::from_hash_bytes(&[1, 2, 3, 4]).unwrap();
        assert_eq!(fp.to_string(), "🐱 🍇 🚑 🎾");
    }
}
