//! Session-key exchange for calls.
//!
//! # Protocol
//!
//! 1. The distributing peer generates a random 32-byte session key.
//! 2. It computes the X25519 shared secret between its identity key and the
//!    recipient's public key.
//! 3. A wrapping key is derived with HKDF-SHA256 over a fresh 16-byte salt and
//!    the call-specific context label [`WRAP_CONTEXT`].
//! 4. The session key is sealed with AES-256-GCM under the wrapping key and
//!    sent as `{salt, iv, wrappedKeyCiphertext}`.
//! 5. The recipient repeats the derivation from its side of the shared secret
//!    and opens the ciphertext.
//!
//! Both peers display [`session_key_hash`] (as emoji) so users can confirm
//! they ended up with the same key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const SESSION_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;

/// HKDF info label. Keeps the wrapping key distinct from any other use of the
/// same X25519 shared secret.
pub const WRAP_CONTEXT: &[u8] = b"e2ecall/call-session-key/v1";

#[derive(Debug, Error)]
pub enum KeyExchangeError {
    #[error("public key lookup failed for {user}: {reason}")]
    PublicKeyLookup { user: String, reason: String },

    #[error("invalid public key length: {0}")]
    InvalidPublicKey(usize),

    #[error("shared secret is not contributory")]
    NonContributory,

    #[error("malformed wrapped key: {0}")]
    MalformedPayload(&'static str),

    #[error("wrapping key derivation failed")]
    Derivation,

    #[error("session key wrap failed")]
    WrapFailed,

    #[error("session key unwrap failed")]
    UnwrapFailed,

    #[error("session key hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },
}

/// Raw symmetric key encrypting one call's media frames.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyExchangeError> {
        let arr: [u8; SESSION_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyExchangeError::MalformedPayload("session key length"))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    pub fn hash(&self) -> String {
        session_key_hash(self)
    }

    /// Check the key against the hash advertised alongside it.
    pub fn verify_hash(&self, expected: &str) -> Result<(), KeyExchangeError> {
        let got = self.hash();
        if got == expected {
            Ok(())
        } else {
            Err(KeyExchangeError::HashMismatch {
                expected: expected.to_string(),
                got,
            })
        }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKey").field(&self.hash()).finish()
    }
}

/// Generate a fresh session key together with its display hash.
pub fn generate_session_key() -> (SessionKey, String) {
    let key = SessionKey::generate();
    let hash = key.hash();
    (key, hash)
}

/// Base64 of the first four bytes of SHA-256(key).
pub fn session_key_hash(key: &SessionKey) -> String {
    let digest = super::sha256(key.as_bytes());
    STANDARD.encode(&digest[..4])
}

/// Long-term X25519 identity of the local user.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut bytes[..]);
        Self::from_secret_bytes(*bytes)
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    fn wrapping_key(
        &self,
        remote: &PublicKey,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, KeyExchangeError> {
        let shared = self.secret.diffie_hellman(remote);
        if !shared.was_contributory() {
            return Err(KeyExchangeError::NonContributory);
        }
        let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(WRAP_CONTEXT, &mut okm[..])
            .map_err(|_| KeyExchangeError::Derivation)?;
        Ok(okm)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, KeyExchangeError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyExchangeError::InvalidPublicKey(bytes.len()))?;
    Ok(PublicKey::from(arr))
}

/// Session key sealed for one recipient. Never contains the raw key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyPayload {
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub wrapped_key_ciphertext: Vec<u8>,
}

/// Seal `key` so that only the holder of `recipient`'s secret can open it.
pub fn wrap_for_recipient(
    identity: &IdentityKeyPair,
    recipient: &PublicKey,
    key: &SessionKey,
) -> Result<WrappedKeyPayload, KeyExchangeError> {
    let mut salt = vec![0u8; SALT_LEN];
    let mut iv = vec![0u8; IV_LEN];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let wrapping_key = identity.wrapping_key(recipient, &salt)?;
    let cipher =
        Aes256Gcm::new_from_slice(&wrapping_key[..]).map_err(|_| KeyExchangeError::WrapFailed)?;
    let wrapped_key_ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), key.as_bytes().as_slice())
        .map_err(|_| KeyExchangeError::WrapFailed)?;

    Ok(WrappedKeyPayload {
        salt,
        iv,
        wrapped_key_ciphertext,
    })
}

/// Open a payload produced by [`wrap_for_recipient`] on the sender's side.
pub fn unwrap_from_sender(
    identity: &IdentityKeyPair,
    sender: &PublicKey,
    payload: &WrappedKeyPayload,
) -> Result<SessionKey, KeyExchangeError> {
    if payload.salt.len() != SALT_LEN {
        return Err(KeyExchangeError::MalformedPayload("salt length"));
    }
    if payload.iv.len() != IV_LEN {
        return Err(KeyExchangeError::MalformedPayload("iv length"));
    }

    let wrapping_key = identity.wrapping_key(sender, &payload.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&wrapping_key[..])
        .map_err(|_| KeyExchangeError::UnwrapFailed)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&payload.iv),
                payload.wrapped_key_ciphertext.as_slice(),
            )
            .map_err(|_| KeyExchangeError::UnwrapFailed)?,
    );
    SessionKey::from_slice(&plaintext)
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
