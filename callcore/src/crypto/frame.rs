//! Per-frame media encryption.
//!
//! Frame layout:
//!
//! ```text
//! version (1) | epoch (4, BE) | nonce (12) | AES-256-GCM ciphertext + tag
//! ```
//!
//! The AAD is `version | epoch | session_id`, so a frame cannot be replayed
//! into another call or relabelled with a different epoch.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::fmt;
use thiserror::Error;

use super::key_exchange::SessionKey;
use crate::types::call::SessionId;

pub const FRAME_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
pub const FRAME_HEADER_LEN: usize = 1 + 4 + NONCE_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameCryptoError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("no key for epoch {0}")]
    UnknownEpoch(u32),

    #[error("frame encryption failed")]
    Encrypt,

    #[error("frame authentication failed")]
    Decrypt,
}

fn cipher_for(key: &SessionKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn aad(epoch: u32, session_id: &SessionId) -> [u8; 1 + 4 + 16] {
    let mut out = [0u8; 21];
    out[0] = FRAME_VERSION;
    out[1..5].copy_from_slice(&epoch.to_be_bytes());
    out[5..].copy_from_slice(session_id.as_bytes());
    out
}

/// Seals outgoing frames under one key epoch.
#[derive(Clone)]
pub struct FrameEncryptor {
    cipher: Aes256Gcm,
    epoch: u32,
    session_id: SessionId,
}

impl FrameEncryptor {
    pub fn new(key: &SessionKey, epoch: u32, session_id: SessionId) -> Self {
        Self {
            cipher: cipher_for(key),
            epoch,
            session_id,
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn encrypt(&self, frame: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let aad = aad(self.epoch, &self.session_id);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: frame,
                    aad: &aad,
                },
            )
            .map_err(|_| FrameCryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + ciphertext.len());
        out.push(FRAME_VERSION);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl fmt::Debug for FrameEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEncryptor")
            .field("epoch", &self.epoch)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Opens incoming frames for the current epoch and the one before it, so
/// frames already in flight during a rotation still decrypt.
#[derive(Clone)]
pub struct FrameDecryptor {
    current: (u32, Aes256Gcm),
    previous: Option<(u32, Aes256Gcm)>,
    session_id: SessionId,
}

impl FrameDecryptor {
    pub fn new(key: &SessionKey, epoch: u32, session_id: SessionId) -> Self {
        Self {
            current: (epoch, cipher_for(key)),
            previous: None,
            session_id,
        }
    }

    pub fn with_previous(mut self, key: &SessionKey, epoch: u32) -> Self {
        self.previous = Some((epoch, cipher_for(key)));
        self
    }

    pub fn epoch(&self) -> u32 {
        self.current.0
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, FrameCryptoError> {
        if frame.len() < FRAME_HEADER_LEN + TAG_LEN {
            return Err(FrameCryptoError::TooShort(frame.len()));
        }
        if frame[0] != FRAME_VERSION {
            return Err(FrameCryptoError::UnsupportedVersion(frame[0]));
        }
        let mut epoch_bytes = [0u8; 4];
        epoch_bytes.copy_from_slice(&frame[1..5]);
        let epoch = u32::from_be_bytes(epoch_bytes);

        let cipher = if epoch == self.current.0 {
            &self.current.1
        } else {
            match &self.previous {
                Some((prev, cipher)) if *prev == epoch => cipher,
                _ => return Err(FrameCryptoError::UnknownEpoch(epoch)),
            }
        };

        let aad = aad(epoch, &self.session_id);
        cipher
            .decrypt(
                Nonce::from_slice(&frame[5..FRAME_HEADER_LEN]),
                Payload {
                    msg: &frame[FRAME_HEADER_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|_| FrameCryptoError::Decrypt)
    }
}

impl fmt::Debug for FrameDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDecryptor")
            .field("epoch", &self.current.0)
            .field("previous_epoch", &self.previous.as_ref().map(|(e, _)| *e))
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SessionKey, SessionId) {
        (SessionKey::generate(), SessionId::generate())
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let (key, sid) = setup();
        let enc = FrameEncryptor::new(&key, 0, sid);
        let dec = FrameDecryptor::new(&key, 0, sid);

        let sealed = enc.encrypt(b"opus frame").unwrap();
        assert_eq!(sealed[0], FRAME_VERSION);
        assert_eq!(sealed.len(), FRAME_HEADER_LEN + 10 + TAG_LEN);
        assert_eq!(dec.decrypt(&sealed).unwrap(), b"opus frame");
    }

    #[test]
    fn test_nonce_is_fresh_per_frame() {
        let (key, sid) = setup();
        let enc = FrameEncryptor::new(&key, 0, sid);
        let a = enc.encrypt(b"same").unwrap();
        let b = enc.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_session_id_rejected() {
        let (key, sid) = setup();
        let sealed = FrameEncryptor::new(&key, 0, sid).encrypt(b"x").unwrap();
        let dec = FrameDecryptor::new(&key, 0, SessionId::generate());
        assert_eq!(dec.decrypt(&sealed), Err(FrameCryptoError::Decrypt));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (key, sid) = setup();
        let sealed = FrameEncryptor::new(&key, 0, sid).encrypt(b"x").unwrap();
        let dec = FrameDecryptor::new(&SessionKey::generate(), 0, sid);
        assert_eq!(dec.decrypt(&sealed), Err(FrameCryptoError::Decrypt));
    }

    #[test]
    fn test_relabelled_epoch_rejected() {
        let (key, sid) = setup();
        let mut sealed = FrameEncryptor::new(&key, 1, sid).encrypt(b"x").unwrap();
        sealed[4] = 0; // epoch 1 -> 0
        let dec = FrameDecryptor::new(&key, 0, sid);
        assert_eq!(dec.decrypt(&sealed), Err(FrameCryptoError::Decrypt));
    }

    #[test]
    fn test_previous_epoch_still_opens() {
        let sid = SessionId::generate();
        let old = SessionKey::generate();
        let new = SessionKey::generate();

        let in_flight = FrameEncryptor::new(&old, 3, sid).encrypt(b"late").unwrap();
        let fresh = FrameEncryptor::new(&new, 4, sid).encrypt(b"new").unwrap();

        let dec = FrameDecryptor::new(&new, 4, sid).with_previous(&old, 3);
        assert_eq!(dec.decrypt(&in_flight).unwrap(), b"late");
        assert_eq!(dec.decrypt(&fresh).unwrap(), b"new");

        let stale = FrameEncryptor::new(&old, 2, sid).encrypt(b"old").unwrap();
        assert_eq!(dec.decrypt(&stale), Err(FrameCryptoError::UnknownEpoch(2)));
    }

    #[test]
    fn test_malformed_frames() {
        let (key, sid) = setup();
        let dec = FrameDecryptor::new(&key, 0, sid);
        assert_eq!(dec.decrypt(&[1, 2, 3]), Err(FrameCryptoError::TooShort(3)));

        let mut sealed = FrameEncryptor::new(&key, 0, sid).encrypt(b"x").unwrap();
        sealed[0] = 9;
        assert_eq!(
            dec.decrypt(&sealed),
            Err(FrameCryptoError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_debug_omits_key() {
        let (key, sid) = setup();
        let rendered = format!("{:?}", FrameEncryptor::new(&key, 5, sid));
        assert!(rendered.contains("epoch: 5"));
        assert!(!rendered.contains("cipher"));
    }
}
