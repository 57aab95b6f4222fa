//! Call encryption primitives.
//!
//! - [`key_exchange`]: session-key generation, hashing and the
//!   X25519 + HKDF + AES-GCM wrap used to hand the key to the peer.
//! - [`fingerprint`]: emoji rendering of the key hash for out-of-band checks.
//! - [`frame`]: per-frame AEAD applied by the media pipeline hooks.

pub mod fingerprint;
pub mod frame;
pub mod key_exchange;

pub use fingerprint::KeyFingerprint;
pub use frame::{FrameCryptoError, FrameDecryptor, FrameEncryptor};
pub use key_exchange::{
    IdentityKeyPair, KeyExchangeError, SessionKey, WrappedKeyPayload, generate_session_key,
    session_key_hash, unwrap_from_sender, wrap_for_recipient,
};

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
