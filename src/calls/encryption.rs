//! Frame encryption binding.
//!
//! Once a session key exists every sender gets an encrypt transform and every
//! receiver a decrypt transform. Bound endpoint ids are remembered so each
//! endpoint is bound once per key; a rotation clears the sets and rebinds.
//!
//! Audio binding failures are tolerated (the call keeps going). A video or
//! screen-share endpoint that cannot be bound is an error: the caller must
//! not let that media flow unencrypted.

use super::error::CallError;
use super::media::{FrameTransform, PeerConnection, RtpReceiver, RtpSender};
use callcore::crypto::{FrameDecryptor, FrameEncryptor, SessionKey};
use callcore::types::call::{MediaKind, SessionId};
use log::{debug, warn};
use std::collections::HashSet;

pub struct EncryptTransform(FrameEncryptor);

impl FrameTransform for EncryptTransform {
    fn transform(&self, frame: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.0.encrypt(frame)?)
    }
}

pub struct DecryptTransform(FrameDecryptor);

impl FrameTransform for DecryptTransform {
    fn transform(&self, frame: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(self.0.decrypt(frame)?)
    }
}

/// Who generated the installed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// We generated and distributed it; we own rotation.
    Local,
    /// The peer sent it to us.
    Remote,
}

/// Current key plus the one it replaced, so in-flight frames still decrypt.
pub struct SessionKeys {
    current: SessionKey,
    epoch: u32,
    previous: Option<(SessionKey, u32)>,
    origin: KeyOrigin,
}

impl SessionKeys {
    pub fn new(key: SessionKey, origin: KeyOrigin) -> Self {
        Self::at_epoch(key, 0, origin)
    }

    pub fn at_epoch(key: SessionKey, epoch: u32, origin: KeyOrigin) -> Self {
        Self {
            current: key,
            epoch,
            previous: None,
            origin,
        }
    }

    /// Install a new key as the next epoch.
    pub fn advance(&mut self, key: SessionKey, origin: KeyOrigin) {
        let next = self.epoch.wrapping_add(1);
        self.install_at(key, next, origin);
    }

    /// Install `key` at `epoch`. A key for the current epoch replaces the
    /// current one and keeps the previous; a later epoch pushes the current
    /// key to previous. Returns false, changing nothing, for an older epoch or
    /// for the key already installed.
    pub fn install_at(&mut self, key: SessionKey, epoch: u32, origin: KeyOrigin) -> bool {
        if epoch < self.epoch || (epoch == self.epoch && key == self.current) {
            return false;
        }
        let old = std::mem::replace(&mut self.current, key);
        if epoch > self.epoch {
            self.previous = Some((old, self.epoch));
        }
        self.epoch = epoch;
        self.origin = origin;
        true
    }

    pub fn current(&self) -> &SessionKey {
        &self.current
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    pub fn hash(&self) -> String {
        self.current.hash()
    }

    pub fn previous_hash(&self) -> Option<String> {
        self.previous.as_ref().map(|(k, _)| k.hash())
    }

    pub fn encryptor(&self, session_id: SessionId) -> FrameEncryptor {
        FrameEncryptor::new(&self.current, self.epoch, session_id)
    }

    pub fn decryptor(&self, session_id: SessionId) -> FrameDecryptor {
        let decryptor = FrameDecryptor::new(&self.current, self.epoch, session_id);
        match &self.previous {
            Some((key, epoch)) => decryptor.with_previous(key, *epoch),
            None => decryptor,
        }
    }
}

/// Endpoint ids that already carry a transform for the current key.
#[derive(Debug, Default)]
pub struct BoundEndpoints {
    senders: HashSet<String>,
    receivers: HashSet<String>,
}

impl BoundEndpoints {
    pub fn clear(&mut self) {
        self.senders.clear();
        self.receivers.clear();
    }

    pub fn has_sender(&self, id: &str) -> bool {
        self.senders.contains(id)
    }

    pub fn has_receiver(&self, id: &str) -> bool {
        self.receivers.contains(id)
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn forget_sender(&mut self, id: &str) {
        self.senders.remove(id);
    }
}

fn binding_failure(kind: MediaKind, endpoint: &str, e: anyhow::Error) -> Result<(), CallError> {
    if kind == MediaKind::Audio {
        warn!("Audio endpoint {endpoint} left without frame encryption: {e}");
        Ok(())
    } else {
        Err(CallError::FrameBinding {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }
}

pub fn bind_sender(
    sender: &dyn RtpSender,
    keys: &SessionKeys,
    session_id: SessionId,
    bound: &mut BoundEndpoints,
) -> Result<(), CallError> {
    if bound.has_sender(sender.id()) {
        return Ok(());
    }
    let transform = std::sync::Arc::new(EncryptTransform(keys.encryptor(session_id)));
    match sender.set_transform(transform) {
        Ok(()) => {
            debug!(
                "Bound encryptor to sender {} (epoch {})",
                sender.id(),
                keys.epoch()
            );
            bound.senders.insert(sender.id().to_string());
            Ok(())
        }
        Err(e) => binding_failure(sender.kind(), sender.id(), e),
    }
}

pub fn bind_receiver(
    receiver: &dyn RtpReceiver,
    keys: &SessionKeys,
    session_id: SessionId,
    bound: &mut BoundEndpoints,
) -> Result<(), CallError> {
    if bound.has_receiver(receiver.id()) {
        return Ok(());
    }
    let transform = std::sync::Arc::new(DecryptTransform(keys.decryptor(session_id)));
    match receiver.set_transform(transform) {
        Ok(()) => {
            debug!(
                "Bound decryptor to receiver {} (epoch {})",
                receiver.id(),
                keys.epoch()
            );
            bound.receivers.insert(receiver.id().to_string());
            Ok(())
        }
        Err(e) => binding_failure(receiver.track().kind(), receiver.id(), e),
    }
}

/// Bind every endpoint of `pc` that is not bound yet.
///
/// All endpoints are attempted; the first video failure is returned.
pub fn bind(
    pc: &dyn PeerConnection,
    keys: &SessionKeys,
    session_id: SessionId,
    bound: &mut BoundEndpoints,
) -> Result<(), CallError> {
    let mut first_error = None;

    for receiver in pc.receivers() {
        if let Err(e) = bind_receiver(receiver.as_ref(), keys, session_id, bound) {
            first_error.get_or_insert(e);
        }
    }
    for sender in pc.senders() {
        if let Err(e) = bind_sender(sender.as_ref(), keys, session_id, bound) {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackPeerConnection, LoopbackTrack};

    fn keys() -> SessionKeys {
        SessionKeys::new(SessionKey::generate(), KeyOrigin::Local)
    }

    #[test]
    fn test_install_at_keeps_epochs_aligned() {
        let k1 = SessionKey::generate();
        let k2 = SessionKey::generate();
        let k3 = SessionKey::generate();
        let mut keys = SessionKeys::new(k1.clone(), KeyOrigin::Remote);

        assert!(keys.install_at(k2.clone(), 1, KeyOrigin::Remote));
        // duplicate delivery
        assert!(!keys.install_at(k2.clone(), 1, KeyOrigin::Remote));
        assert_eq!(keys.epoch(), 1);

        // retried distribution for the same epoch replaces the key in place
        assert!(keys.install_at(k3.clone(), 1, KeyOrigin::Remote));
        assert_eq!(keys.epoch(), 1);
        assert_eq!(keys.hash(), k3.hash());
        assert_eq!(keys.previous_hash(), Some(k1.hash()));

        // stale epoch
        assert!(!keys.install_at(k1, 0, KeyOrigin::Remote));
        assert_eq!(keys.hash(), k3.hash());
    }

    #[test]
    fn test_existing_video_sender_bound_exactly_once() {
        let (pc, _events) = LoopbackPeerConnection::new();
        let sender = pc
            .add_track(LoopbackTrack::new(MediaKind::Video))
            .unwrap();
        let keys = keys();
        let sid = SessionId::generate();
        let mut bound = BoundEndpoints::default();

        assert!(!bound.has_sender(sender.id()));
        bind(pc.as_ref(), &keys, sid, &mut bound).unwrap();
        bind(pc.as_ref(), &keys, sid, &mut bound).unwrap();

        assert!(bound.has_sender(sender.id()));
        assert_eq!(bound.sender_count(), 1);
        assert_eq!(pc.transform_installs(sender.id()), 1);
    }

    #[test]
    fn test_audio_failure_tolerated_video_failure_fails_closed() {
        let (pc, _events) = LoopbackPeerConnection::new();
        pc.fail_transforms_for(MediaKind::Audio);
        let audio = pc.add_track(LoopbackTrack::new(MediaKind::Audio)).unwrap();
        let keys = keys();
        let sid = SessionId::generate();
        let mut bound = BoundEndpoints::default();

        bind(pc.as_ref(), &keys, sid, &mut bound).unwrap();
        assert!(!bound.has_sender(audio.id()));

        pc.fail_transforms_for(MediaKind::Video);
        let video = pc.add_track(LoopbackTrack::new(MediaKind::Video)).unwrap();
        let err = bind(pc.as_ref(), &keys, sid, &mut bound).unwrap_err();
        match err {
            CallError::FrameBinding { endpoint, .. } => assert_eq!(endpoint, video.id()),
            other => panic!("expected binding failure, got {other:?}"),
        }
    }

    #[test]
    fn test_advance_keeps_previous_epoch_decryptable() {
        let sid = SessionId::generate();
        let mut keys = keys();
        let old_frame = keys.encryptor(sid).encrypt(b"before").unwrap();
        let old_hash = keys.hash();

        keys.advance(SessionKey::generate(), KeyOrigin::Local);
        assert_eq!(keys.epoch(), 1);
        assert_eq!(keys.previous_hash(), Some(old_hash));

        let dec = DecryptTransform(keys.decryptor(sid));
        assert_eq!(dec.transform(&old_frame).unwrap(), b"before");
        let enc = EncryptTransform(keys.encryptor(sid));
        let new_frame = enc.transform(b"after").unwrap();
        assert_eq!(dec.transform(&new_frame).unwrap(), b"after");
    }

    #[test]
    fn test_clear_forces_rebind() {
        let (pc, _events) = LoopbackPeerConnection::new();
        let sender = pc.add_track(LoopbackTrack::new(MediaKind::Audio)).unwrap();
        let keys = keys();
        let sid = SessionId::generate();
        let mut bound = BoundEndpoints::default();

        bind(pc.as_ref(), &keys, sid, &mut bound).unwrap();
        bound.clear();
        bind(pc.as_ref(), &keys, sid, &mut bound).unwrap();

        assert_eq!(pc.transform_installs(sender.id()), 2);
        assert_eq!(bound.sender_count(), 1);
    }
}
