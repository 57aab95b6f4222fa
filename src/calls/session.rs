//! One call with one remote user.
//!
//! A session owns its peer connection and local media. It is always accessed
//! through `Arc<Mutex<CallSession>>`; background work (peer-connection event
//! pump, key rotation, negotiation watchdog) holds only a `Weak` handle and
//! takes the lock for each step, so all mutations are serialized.

use super::context::CallContext;
use super::encryption::{BoundEndpoints, KeyOrigin, SessionKeys, bind, bind_receiver, bind_sender};
use super::error::CallError;
use super::events::CallEvent;
use super::media::{
    ConnectionState, MediaTrack, PeerConnection, PeerConnectionEvent, RtpReceiver, RtpSender,
    SignalingState,
};
use crate::signaling::SignalingError;
use callcore::crypto::{KeyFingerprint, SessionKey};
use callcore::signaling::{IceCandidate, SessionDescription, SessionKeyPayload, SignalMessage};
use callcore::state::{CallInfo, CallState, CallTransition, InvalidTransition};
use callcore::track_router::TrackRouter;
use callcore::types::call::{EndCallReason, MediaKind, SessionId, TrackClass, UserId};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A local track and the sender carrying it.
struct LocalMedia {
    track: Arc<dyn MediaTrack>,
    sender: Arc<dyn RtpSender>,
}

impl LocalMedia {
    fn stop(&self) {
        self.track.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Camera,
    Screen,
}

impl Capture {
    fn toggle_message(self, enabled: bool) -> SignalMessage {
        match self {
            Self::Camera => SignalMessage::CallVideoToggle { enabled },
            Self::Screen => SignalMessage::CallScreenShareToggle { enabled },
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Camera => "video",
            Self::Screen => "screen share",
        }
    }
}

pub struct CallSession {
    ctx: Arc<CallContext>,
    this: Weak<Mutex<CallSession>>,
    ended: Arc<AtomicBool>,
    info: CallInfo,

    pc: Option<Arc<dyn PeerConnection>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,

    audio: Option<LocalMedia>,
    video: Option<LocalMedia>,
    screen: Option<LocalMedia>,
    is_muted: bool,

    keys: Option<SessionKeys>,
    /// Rotated key whose distribution was not acknowledged.
    pending_key: Option<(SessionKey, u32)>,
    bound: BoundEndpoints,
    router: TrackRouter,

    is_negotiating: bool,
    negotiation_attempt: u64,
    needs_renegotiation: bool,
    is_ending: bool,

    rotation: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl CallSession {
    pub(crate) fn new(ctx: Arc<CallContext>, info: CallInfo) -> Arc<Mutex<Self>> {
        Self::new_tracked(ctx, info).0
    }

    /// Like [`CallSession::new`], also returning a flag raised once the
    /// session has ended, readable without taking the session lock.
    pub(crate) fn new_tracked(
        ctx: Arc<CallContext>,
        info: CallInfo,
    ) -> (Arc<Mutex<Self>>, Arc<AtomicBool>) {
        let ended = Arc::new(AtomicBool::new(false));
        let session = Arc::new_cyclic(|this| {
            Mutex::new(Self {
                ctx,
                this: this.clone(),
                ended: ended.clone(),
                info,
                pc: None,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                audio: None,
                video: None,
                screen: None,
                is_muted: false,
                keys: None,
                pending_key: None,
                bound: BoundEndpoints::default(),
                router: TrackRouter::new(),
                is_negotiating: false,
                negotiation_attempt: 0,
                needs_renegotiation: false,
                is_ending: false,
                rotation: None,
                watchdog: None,
            })
        });
        (session, ended)
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn peer(&self) -> &UserId {
        &self.info.peer
    }

    pub fn state(&self) -> &CallState {
        &self.info.state
    }

    pub fn session_id(&self) -> SessionId {
        self.info.session_id
    }

    pub fn is_ended(&self) -> bool {
        self.info.state.is_ended()
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video.is_some()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn is_negotiating(&self) -> bool {
        self.is_negotiating
    }

    pub fn needs_renegotiation(&self) -> bool {
        self.needs_renegotiation
    }

    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.pc.clone()
    }

    pub fn track_router(&self) -> &TrackRouter {
        &self.router
    }

    pub fn bound_endpoints(&self) -> &BoundEndpoints {
        &self.bound
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn key_hash(&self) -> Option<String> {
        self.keys.as_ref().map(|k| k.hash())
    }

    pub fn key_epoch(&self) -> Option<u32> {
        self.keys.as_ref().map(|k| k.epoch())
    }

    pub fn key_origin(&self) -> Option<KeyOrigin> {
        self.keys.as_ref().map(|k| k.origin())
    }

    pub fn fingerprint(&self) -> Option<KeyFingerprint> {
        KeyFingerprint::from_hash(&self.key_hash()?)
    }

    pub fn is_rotation_scheduled(&self) -> bool {
        self.rotation.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn emit(&self, event: CallEvent) {
        self.ctx.events.dispatch(&event);
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.ctx
            .signaling
            .send_signal(&self.info.peer, message)
            .await
    }

    fn transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let from = self.info.state.name();
        self.info.apply_transition(transition)?;
        debug!(
            "Call with {}: {from} -> {} ({transition:?})",
            self.info.peer,
            self.info.state.name()
        );
        Ok(())
    }

    fn ensure_in_call(&self, action: &str) -> Result<(), CallError> {
        match self.info.state {
            CallState::Accepted { .. } | CallState::Negotiating { .. } | CallState::Active { .. } => {
                Ok(())
            }
            ref other => Err(InvalidTransition {
                current_state: other.name(),
                attempted: action.to_string(),
            }
            .into()),
        }
    }

    // Peer connection

    async fn ensure_peer_connection(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        if let Some(pc) = &self.pc {
            return Ok(pc.clone());
        }
        let ctx = self.ctx.clone();
        let ice_servers = ctx.ice_servers().await;
        let (pc, events) = ctx
            .pc_factory
            .create_peer_connection(ice_servers)
            .await
            .map_err(CallError::Negotiation)?;
        debug!(
            "Created peer connection for {} with {} ICE servers",
            self.info.peer,
            ice_servers.len()
        );
        spawn_peer_event_pump(self.this.clone(), events);
        self.pc = Some(pc.clone());
        Ok(pc)
    }

    /// Add the microphone (or silence while muted). Failure leaves the call
    /// receive-only.
    async fn attach_microphone(&mut self, pc: &Arc<dyn PeerConnection>) {
        let track = if self.is_muted {
            Ok(self.ctx.devices.silent_audio())
        } else {
            self.ctx.devices.microphone().await
        };
        let track = match track {
            Ok(t) => t,
            Err(e) => {
                warn!("Microphone unavailable, continuing receive-only: {e}");
                return;
            }
        };
        let sender = match pc.add_track(track.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to add microphone track: {e}");
                track.stop();
                return;
            }
        };
        if let Some(keys) = &self.keys
            && let Err(e) = bind_sender(sender.as_ref(), keys, self.info.session_id, &mut self.bound)
        {
            warn!("Audio sender binding failed: {e}");
        }
        self.audio = Some(LocalMedia { track, sender });
    }

    fn bind_all(&mut self) -> Result<(), CallError> {
        let (Some(pc), Some(keys)) = (&self.pc, &self.keys) else {
            return Ok(());
        };
        bind(pc.as_ref(), keys, self.info.session_id, &mut self.bound)
    }

    async fn handle_peer_event(&mut self, event: PeerConnectionEvent) {
        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                if let Err(e) = self.send(SignalMessage::CallIceCandidate(candidate)).await {
                    warn!("Failed to send ICE candidate to {}: {e}", self.info.peer);
                }
            }
            PeerConnectionEvent::Track(receiver) => self.on_remote_track(receiver),
            PeerConnectionEvent::ConnectionStateChanged(state) => {
                self.emit(CallEvent::ConnectionState {
                    peer: self.info.peer.clone(),
                    state,
                });
                if state.is_terminal() {
                    let err = CallError::TransportTerminal(state);
                    warn!("Call with {}: {err}", self.info.peer);
                    self.end(err.end_reason(), true).await;
                } else if state == ConnectionState::Disconnected {
                    debug!("Peer connection with {} disconnected, waiting for ICE", self.info.peer);
                }
            }
        }
    }

    fn on_remote_track(&mut self, receiver: Arc<dyn RtpReceiver>) {
        let track = receiver.track();
        let class = match track.kind() {
            MediaKind::Audio => TrackClass::Audio,
            MediaKind::Video => self.router.classify(MediaKind::Video),
        };

        if let Some(keys) = &self.keys {
            if let Err(e) =
                bind_receiver(receiver.as_ref(), keys, self.info.session_id, &mut self.bound)
            {
                error!("Dropping remote {class:?} track from {}: {e}", self.info.peer);
                return;
            }
        } else {
            debug!("Remote {class:?} track from {} arrived before the session key", self.info.peer);
        }

        let peer = self.info.peer.clone();
        self.emit(match class {
            TrackClass::Audio => CallEvent::RemoteAudio { peer, track },
            TrackClass::Video => CallEvent::RemoteVideo { peer, track },
            TrackClass::ScreenShare => CallEvent::RemoteScreenShare { peer, track },
        });
    }

    // Negotiation

    fn begin_negotiation(&mut self) {
        self.is_negotiating = true;
        self.negotiation_attempt += 1;
        if let Some(h) = self.watchdog.take() {
            h.abort();
        }
        let attempt = self.negotiation_attempt;
        let timeout = self.ctx.config.negotiation_timeout;
        let this = self.this.clone();
        self.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = this.upgrade() else {
                return;
            };
            let mut session = session.lock().await;
            if session.is_negotiating && session.negotiation_attempt == attempt {
                warn!(
                    "Negotiation with {} did not finish within {timeout:?}, releasing guard",
                    session.info.peer
                );
                session.is_negotiating = false;
            }
        }));
    }

    fn finish_negotiation(&mut self) {
        self.is_negotiating = false;
        if let Some(h) = self.watchdog.take() {
            h.abort();
        }
    }

    async fn send_offer(&mut self, pc: &Arc<dyn PeerConnection>) -> Result<(), CallError> {
        self.begin_negotiation();
        let offer = pc.create_offer().await.map_err(CallError::Negotiation)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(CallError::Negotiation)?;
        self.send(SignalMessage::CallOffer(offer)).await?;
        self.transition(CallTransition::OfferSent)?;
        Ok(())
    }

    /// Create and send an offer. Any failure ends the call.
    async fn negotiate(&mut self, pc: &Arc<dyn PeerConnection>) -> Result<(), CallError> {
        match self.send_offer(pc).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Negotiation with {} failed: {e}", self.info.peer);
                self.finish_negotiation();
                self.end(EndCallReason::NegotiationFailed, true).await;
                Err(e)
            }
        }
    }

    /// Send a fresh offer after the local track set changed.
    ///
    /// Skipped (and remembered) while another exchange is in flight or the
    /// call has not reached `Active` yet.
    pub async fn renegotiate(&mut self) -> Result<(), CallError> {
        if self.is_ended() {
            return Ok(());
        }
        let Some(pc) = self.pc.clone() else {
            return Ok(());
        };
        if !self.info.state.is_active()
            || self.is_negotiating
            || pc.signaling_state() != SignalingState::Stable
        {
            debug!("Deferring renegotiation with {}", self.info.peer);
            self.needs_renegotiation = true;
            return Ok(());
        }
        self.needs_renegotiation = false;
        self.negotiate(&pc).await
    }

    async fn renegotiate_if_needed(&mut self) {
        if self.needs_renegotiation {
            // failures already ended the call
            let _ = self.renegotiate().await;
        }
    }

    async fn flush_pending_candidates(&mut self, pc: &Arc<dyn PeerConnection>) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued ICE candidate: {e}");
            }
        }
    }

    pub(crate) async fn on_offer(&mut self, offer: SessionDescription) {
        if self.is_ended() {
            return;
        }
        if let Err(e) = self.transition(CallTransition::OfferReceived) {
            warn!("Ignoring offer from {}: {e}", self.info.peer);
            return;
        }
        let pc = match self.ensure_peer_connection().await {
            Ok(pc) => pc,
            Err(e) => {
                error!("Cannot answer {}: {e}", self.info.peer);
                self.end(EndCallReason::NegotiationFailed, true).await;
                return;
            }
        };

        if pc.signaling_state() == SignalingState::HaveLocalOffer {
            if self.info.is_initiator() {
                info!("Offer collision with {}, keeping our offer", self.info.peer);
                return;
            }
            info!("Offer collision with {}, rolling back our offer", self.info.peer);
            if let Err(e) = pc.set_local_description(SessionDescription::rollback()).await {
                error!("Rollback failed: {e}");
                self.end(EndCallReason::NegotiationFailed, true).await;
                return;
            }
            self.finish_negotiation();
            self.needs_renegotiation = true;
        }

        let was_active = self.info.state.is_active();
        match self.answer(&pc, offer).await {
            Ok(()) => {
                if !was_active && self.info.state.is_active() {
                    self.emit(CallEvent::CallActive {
                        peer: self.info.peer.clone(),
                    });
                }
                self.renegotiate_if_needed().await;
            }
            Err(e) => {
                error!("Answering {} failed: {e}", self.info.peer);
                self.end(EndCallReason::NegotiationFailed, true).await;
            }
        }
    }

    async fn answer(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        pc.set_remote_description(offer)
            .await
            .map_err(CallError::Negotiation)?;
        self.remote_description_set = true;
        self.flush_pending_candidates(pc).await;

        if self.audio.is_none() {
            self.attach_microphone(pc).await;
        }
        if let Err(e) = self.bind_all() {
            warn!("Frame encryption binding incomplete: {e}");
        }

        let answer = pc.create_answer().await.map_err(CallError::Negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(CallError::Negotiation)?;
        self.send(SignalMessage::CallAnswer(answer)).await?;
        self.transition(CallTransition::AnswerSent)?;
        Ok(())
    }

    pub(crate) async fn on_answer(&mut self, answer: SessionDescription) {
        if self.is_ended() {
            return;
        }
        let Some(pc) = self.pc.clone() else {
            debug!("Ignoring answer from {} without a peer connection", self.info.peer);
            return;
        };
        if pc.signaling_state() != SignalingState::HaveLocalOffer {
            debug!(
                "Ignoring answer from {} in {:?}",
                self.info.peer,
                pc.signaling_state()
            );
            return;
        }

        let was_active = self.info.state.is_active();
        match self.apply_answer(&pc, answer).await {
            Ok(()) => {
                if !was_active && self.info.state.is_active() {
                    info!("Call with {} is active", self.info.peer);
                    self.emit(CallEvent::CallActive {
                        peer: self.info.peer.clone(),
                    });
                }
                self.renegotiate_if_needed().await;
            }
            Err(e) => {
                error!("Applying answer from {} failed: {e}", self.info.peer);
                self.finish_negotiation();
                self.end(EndCallReason::NegotiationFailed, true).await;
            }
        }
    }

    async fn apply_answer(
        &mut self,
        pc: &Arc<dyn PeerConnection>,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        pc.set_remote_description(answer)
            .await
            .map_err(CallError::Negotiation)?;
        self.remote_description_set = true;
        self.finish_negotiation();
        self.flush_pending_candidates(pc).await;
        self.transition(CallTransition::AnswerApplied)?;
        if let Err(e) = self.bind_all() {
            warn!("Frame encryption binding incomplete: {e}");
        }
        Ok(())
    }

    pub(crate) async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.is_ended() {
            return;
        }
        match self.pc.clone() {
            Some(pc) if self.remote_description_set => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!("Failed to apply ICE candidate from {}: {e}", self.info.peer);
                }
            }
            _ => {
                debug!("Queueing ICE candidate from {}", self.info.peer);
                self.pending_candidates.push(candidate);
            }
        }
    }

    // Call lifecycle

    /// Send the invite. A failed send tears the session down.
    pub(crate) async fn invite(&mut self) -> Result<(), CallError> {
        self.transition(CallTransition::InviteSent)?;
        let message = SignalMessage::CallInvite {
            from_username: self.ctx.local_username.clone(),
        };
        if let Err(e) = self.send(message).await {
            error!("Failed to invite {}: {e}", self.info.peer);
            self.end(EndCallReason::SignalingFailed, false).await;
            return Err(e.into());
        }
        info!("Invited {} (session {})", self.info.peer, self.info.session_id);
        Ok(())
    }

    pub(crate) fn on_invite(&mut self, username: String) {
        let transition = if matches!(self.info.state, CallState::Inviting { .. }) {
            // both sides called each other: the lower user id keeps its call
            if self.ctx.local_user < self.info.peer {
                info!("Invites crossed with {}, keeping our call", self.info.peer);
                return;
            }
            info!("Invites crossed with {}, answering theirs", self.info.peer);
            CallTransition::InviteCrossed
        } else {
            CallTransition::InviteReceived
        };
        if let Err(e) = self.transition(transition) {
            warn!("Ignoring invite from {}: {e}", self.info.peer);
            return;
        }
        self.info.peer_username = Some(username.clone());
        self.emit(CallEvent::IncomingCall {
            peer: self.info.peer.clone(),
            username,
        });
    }

    /// Accept a ringing call.
    pub async fn accept(&mut self) -> Result<(), CallError> {
        self.transition(CallTransition::LocalAccepted)?;
        let pc = match self.ensure_peer_connection().await {
            Ok(pc) => pc,
            Err(e) => {
                self.end(EndCallReason::NegotiationFailed, true).await;
                return Err(e);
            }
        };
        if self.audio.is_none() {
            self.attach_microphone(&pc).await;
        }
        if let Err(e) = self.send(SignalMessage::CallAccept {}).await {
            error!("Failed to accept call from {}: {e}", self.info.peer);
            self.end(EndCallReason::SignalingFailed, false).await;
            return Err(e.into());
        }
        info!("Accepted call from {}", self.info.peer);
        Ok(())
    }

    /// Decline a ringing call.
    pub async fn reject(&mut self) -> Result<(), CallError> {
        if !self.info.state.can_reject() {
            return Err(InvalidTransition {
                current_state: self.info.state.name(),
                attempted: "reject".to_string(),
            }
            .into());
        }
        let sent = self.send(SignalMessage::CallReject {}).await;
        self.end(EndCallReason::Declined, false).await;
        sent.map_err(Into::into)
    }

    pub async fn hangup(&mut self) {
        self.end(EndCallReason::LocalHangup, true).await;
    }

    /// The peer accepted our invite: distribute the key and send the offer.
    pub(crate) async fn on_remote_accept(&mut self) {
        if let Err(e) = self.transition(CallTransition::RemoteAccepted) {
            warn!("Ignoring accept from {}: {e}", self.info.peer);
            return;
        }
        self.emit(CallEvent::CallAccepted {
            peer: self.info.peer.clone(),
        });

        let pc = match self.ensure_peer_connection().await {
            Ok(pc) => pc,
            Err(e) => {
                error!("Cannot set up media with {}: {e}", self.info.peer);
                self.end(EndCallReason::NegotiationFailed, true).await;
                return;
            }
        };
        if self.audio.is_none() {
            self.attach_microphone(&pc).await;
        }

        let key = SessionKey::generate();
        if let Err(e) = self.distribute_key(&key, self.next_epoch()).await {
            error!("Key distribution to {} failed: {e}", self.info.peer);
            self.end(EndCallReason::KeyExchangeFailed, true).await;
            return;
        }
        if let Err(e) = self.set_session_key(key, KeyOrigin::Local) {
            error!("Cannot protect media with {}: {e}", self.info.peer);
            self.end(EndCallReason::KeyExchangeFailed, true).await;
            return;
        }

        let _ = self.negotiate(&pc).await;
    }

    pub(crate) async fn on_remote_reject(&mut self) {
        self.end(EndCallReason::Rejected, false).await;
    }

    pub(crate) async fn on_remote_end(&mut self) {
        self.end(EndCallReason::RemoteHangup, false).await;
    }

    pub(crate) fn on_remote_video_toggle(&mut self, enabled: bool) {
        self.router.set_remote_video_enabled(enabled);
        self.emit(CallEvent::RemoteVideoToggled {
            peer: self.info.peer.clone(),
            enabled,
        });
    }

    pub(crate) fn on_remote_screen_share_toggle(&mut self, enabled: bool) {
        self.router.set_remote_screen_sharing(enabled);
        self.emit(CallEvent::RemoteScreenShareToggled {
            peer: self.info.peer.clone(),
            enabled,
        });
    }

    /// Terminate the call. Runs once; later calls are no-ops.
    pub async fn end(&mut self, reason: EndCallReason, notify_peer: bool) {
        if self.is_ending || self.is_ended() {
            return;
        }
        self.is_ending = true;
        info!("Ending call with {}: {reason}", self.info.peer);

        if notify_peer && let Err(e) = self.send(SignalMessage::CallEnd {}).await {
            warn!("Failed to notify {} of call end: {e}", self.info.peer);
        }
        self.cleanup().await;
        if let Err(e) = self.transition(CallTransition::Terminated { reason }) {
            warn!("{e}");
        }
        self.ended.store(true, Ordering::Release);
        self.emit(CallEvent::CallEnded {
            peer: self.info.peer.clone(),
            reason,
        });
    }

    /// Release everything the session owns. Safe to call repeatedly.
    pub async fn cleanup(&mut self) {
        if let Some(h) = self.rotation.take() {
            h.abort();
        }
        self.finish_negotiation();
        self.needs_renegotiation = false;
        self.pending_candidates.clear();

        if let Some(pc) = self.pc.take() {
            pc.close().await;
        }
        for media in [self.audio.take(), self.video.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            media.stop();
        }
        self.keys = None;
        self.pending_key = None;
        self.bound.clear();
    }

    // Keys

    async fn distribute_key(&self, key: &SessionKey, epoch: u32) -> Result<(), CallError> {
        let wrapped = self
            .ctx
            .key_exchange
            .wrap_for(&self.info.peer, key)
            .await?;
        self.send(SignalMessage::CallSessionKey(SessionKeyPayload {
            session_key_hash: key.hash(),
            wrapped_session_key: Some(wrapped),
            session_id: Some(self.info.session_id.to_hex()),
            key_epoch: Some(epoch),
        }))
        .await?;
        Ok(())
    }

    fn next_epoch(&self) -> u32 {
        self.keys
            .as_ref()
            .map_or(0, |keys| keys.epoch().wrapping_add(1))
    }

    /// Install `key` at `epoch` and rebind every endpoint. Returns `false`
    /// when the key was already installed or belongs to an older epoch.
    fn install_key(
        &mut self,
        key: SessionKey,
        epoch: u32,
        origin: KeyOrigin,
    ) -> Result<bool, CallError> {
        match &mut self.keys {
            Some(keys) => {
                if !keys.install_at(key, epoch, origin) {
                    return Ok(false);
                }
            }
            None => self.keys = Some(SessionKeys::at_epoch(key, epoch, origin)),
        }
        self.bound.clear();
        if let Some(fingerprint) = self.fingerprint() {
            info!(
                "Session key with {} is now {fingerprint} (epoch {epoch})",
                self.info.peer
            );
            self.emit(CallEvent::KeyFingerprint {
                peer: self.info.peer.clone(),
                fingerprint,
            });
        }
        self.bind_all()?;
        Ok(true)
    }

    /// Install a session key as the next epoch. Locally generated keys
    /// (re)start the rotation timer; keys received from the peer never do.
    pub fn set_session_key(&mut self, key: SessionKey, origin: KeyOrigin) -> Result<(), CallError> {
        let epoch = self.next_epoch();
        let bound = self.install_key(key, epoch, origin);
        if origin == KeyOrigin::Local {
            self.restart_rotation();
        }
        bound.map(|_| ())
    }

    fn restart_rotation(&mut self) {
        if let Some(h) = self.rotation.take() {
            h.abort();
        }
        let period = self.ctx.config.key_rotation_interval;
        let this = self.this.clone();
        self.rotation = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(session) = this.upgrade() else {
                    break;
                };
                let mut session = session.lock().await;
                if session.is_ended() {
                    break;
                }
                session.rotate_key().await;
            }
        }));
    }

    /// Replace the key with a fresh independent one and send it to the peer.
    ///
    /// When the send fails the current key stays in place. The new key is
    /// kept as pending, since the peer may have received it anyway: its
    /// confirmation installs it, and the next rotation reuses its epoch.
    pub async fn rotate_key(&mut self) {
        if self.key_origin() != Some(KeyOrigin::Local) {
            return;
        }
        let key = SessionKey::generate();
        let epoch = self.next_epoch();
        if let Err(e) = self.distribute_key(&key, epoch).await {
            warn!(
                "Key rotation with {} failed, keeping epoch {}: {e}",
                self.info.peer,
                self.key_epoch().unwrap_or_default()
            );
            self.pending_key = Some((key, epoch));
            return;
        }
        self.pending_key = None;
        if let Err(e) = self.install_key(key, epoch, KeyOrigin::Local) {
            warn!("Rebinding after rotation incomplete: {e}");
        }
    }

    pub(crate) async fn on_session_key(&mut self, payload: SessionKeyPayload) {
        if self.is_ended() {
            return;
        }
        match payload.wrapped_session_key {
            Some(wrapped) => {
                let key = match self
                    .ctx
                    .key_exchange
                    .unwrap_from(&self.info.peer, &wrapped)
                    .await
                    .and_then(|key| key.verify_hash(&payload.session_key_hash).map(|()| key))
                {
                    Ok(key) => key,
                    Err(e) => {
                        error!("Rejecting session key from {}: {e}", self.info.peer);
                        self.end(EndCallReason::KeyExchangeFailed, true).await;
                        return;
                    }
                };
                match payload.session_id.as_deref().map(SessionId::from_hex) {
                    Some(Some(id)) => self.info.session_id = id,
                    Some(None) => warn!("Ignoring malformed session id from {}", self.info.peer),
                    None => {}
                }
                let epoch = payload.key_epoch.unwrap_or_else(|| self.next_epoch());
                let hash = payload.session_key_hash;
                match self.install_key(key, epoch, KeyOrigin::Remote) {
                    Ok(true) => {}
                    Ok(false) if self.key_hash().as_deref() == Some(hash.as_str()) => {
                        debug!("Session key epoch {epoch} from {} delivered again", self.info.peer);
                    }
                    Ok(false) => {
                        warn!(
                            "Ignoring stale session key epoch {epoch} from {} (at epoch {})",
                            self.info.peer,
                            self.key_epoch().unwrap_or_default()
                        );
                        return;
                    }
                    Err(e) => {
                        error!("Cannot protect media with {}: {e}", self.info.peer);
                        self.end(EndCallReason::KeyExchangeFailed, true).await;
                        return;
                    }
                }
                let confirmation = SignalMessage::CallSessionKey(SessionKeyPayload {
                    session_key_hash: hash,
                    wrapped_session_key: None,
                    session_id: None,
                    key_epoch: Some(epoch),
                });
                if let Err(e) = self.send(confirmation).await {
                    warn!("Failed to confirm session key to {}: {e}", self.info.peer);
                }
            }
            None => self.on_key_confirmation(payload.session_key_hash).await,
        }
    }

    async fn on_key_confirmation(&mut self, hash: String) {
        let Some(keys) = &self.keys else {
            warn!("Key confirmation from {} without a key", self.info.peer);
            return;
        };
        if keys.origin() != KeyOrigin::Local {
            debug!("Ignoring key confirmation for a key we did not send");
            return;
        }
        if hash == keys.hash() {
            debug!("{} confirmed session key epoch {}", self.info.peer, keys.epoch());
        } else if keys.previous_hash().as_deref() == Some(hash.as_str()) {
            debug!("{} confirmed a superseded session key", self.info.peer);
        } else if let Some((key, epoch)) = self
            .pending_key
            .take_if(|(key, _)| key.hash() == hash)
        {
            info!("{} installed rotated key epoch {epoch}, adopting it", self.info.peer);
            if let Err(e) = self.install_key(key, epoch, KeyOrigin::Local) {
                warn!("Rebinding after rotation incomplete: {e}");
            }
        } else {
            error!("{} installed a different session key ({hash})", self.info.peer);
            self.end(EndCallReason::KeyExchangeFailed, true).await;
        }
    }

    // Local media controls

    /// Mute or unmute the microphone. Returns whether the call is muted
    /// afterwards.
    pub async fn toggle_mute(&mut self) -> bool {
        if self.is_muted {
            self.unmute().await;
        } else {
            self.mute().await;
        }
        self.is_muted
    }

    async fn mute(&mut self) {
        let Some(audio) = &mut self.audio else {
            self.is_muted = true;
            return;
        };
        let silence = self.ctx.devices.silent_audio();
        match audio.sender.replace_track(Some(silence.clone())).await {
            Ok(()) => {
                let mic = std::mem::replace(&mut audio.track, silence);
                mic.stop();
                self.is_muted = true;
            }
            Err(e) => {
                warn!("Failed to mute: {e}");
                silence.stop();
            }
        }
    }

    async fn unmute(&mut self) {
        let Some(pc) = self.pc.clone() else {
            self.is_muted = false;
            return;
        };
        let mic = match self.ctx.devices.microphone().await {
            Ok(mic) => mic,
            Err(e) => {
                warn!("Failed to unmute: {e}");
                return;
            }
        };

        if let Some(audio) = &mut self.audio {
            match audio.sender.replace_track(Some(mic.clone())).await {
                Ok(()) => {
                    let silence = std::mem::replace(&mut audio.track, mic);
                    silence.stop();
                    self.is_muted = false;
                }
                Err(e) => {
                    warn!("Failed to unmute: {e}");
                    mic.stop();
                }
            }
            return;
        }

        let sender = match pc.add_track(mic.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to add microphone: {e}");
                mic.stop();
                return;
            }
        };
        if let Some(keys) = &self.keys
            && let Err(e) = bind_sender(sender.as_ref(), keys, self.info.session_id, &mut self.bound)
        {
            warn!("Audio sender binding failed: {e}");
        }
        self.audio = Some(LocalMedia { track: mic, sender });
        self.is_muted = false;
        let _ = self.renegotiate().await;
    }

    /// Start or stop sending the camera. Returns whether video is on
    /// afterwards.
    pub async fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.toggle_capture(Capture::Camera).await
    }

    /// Start or stop sharing the screen.
    pub async fn toggle_screen_share(&mut self) -> Result<bool, CallError> {
        self.toggle_capture(Capture::Screen).await
    }

    fn capture_slot(&mut self, capture: Capture) -> &mut Option<LocalMedia> {
        match capture {
            Capture::Camera => &mut self.video,
            Capture::Screen => &mut self.screen,
        }
    }

    async fn toggle_capture(&mut self, capture: Capture) -> Result<bool, CallError> {
        self.ensure_in_call(capture.name())?;

        if let Some(media) = self.capture_slot(capture).take() {
            if let Some(pc) = &self.pc
                && let Err(e) = pc.remove_track(media.sender.as_ref())
            {
                warn!("Failed to remove {} sender: {e}", capture.name());
            }
            self.bound.forget_sender(media.sender.id());
            media.stop();
            if let Err(e) = self.send(capture.toggle_message(false)).await {
                warn!("Failed to signal {} off: {e}", capture.name());
            }
            self.renegotiate().await?;
            info!("Stopped {} to {}", capture.name(), self.info.peer);
            return Ok(false);
        }

        if self.keys.is_none() {
            return Err(CallError::NoSessionKey);
        }
        let pc = self.ensure_peer_connection().await?;
        let track = match capture {
            Capture::Camera => self.ctx.devices.camera().await,
            Capture::Screen => self.ctx.devices.screen().await,
        }
        .map_err(CallError::MediaAcquisition)?;

        if let Err(e) = self.send(capture.toggle_message(true)).await {
            track.stop();
            return Err(e.into());
        }
        // let the toggle reach the peer before the track does
        tokio::time::sleep(self.ctx.config.toggle_signal_delay).await;

        let sender = match pc.add_track(track.clone()) {
            Ok(s) => s,
            Err(e) => {
                track.stop();
                self.signal_capture_aborted(capture).await;
                return Err(CallError::Negotiation(e));
            }
        };
        let Some(keys) = &self.keys else {
            return Err(CallError::NoSessionKey);
        };
        if let Err(e) = bind_sender(sender.as_ref(), keys, self.info.session_id, &mut self.bound) {
            error!("Refusing to send unencrypted {}: {e}", capture.name());
            if let Err(e) = pc.remove_track(sender.as_ref()) {
                warn!("Failed to remove {} sender: {e}", capture.name());
            }
            track.stop();
            self.signal_capture_aborted(capture).await;
            return Err(e);
        }

        *self.capture_slot(capture) = Some(LocalMedia { track, sender });
        self.renegotiate().await?;
        info!("Sending {} to {}", capture.name(), self.info.peer);
        Ok(true)
    }

    async fn signal_capture_aborted(&self, capture: Capture) {
        if let Err(e) = self.send(capture.toggle_message(false)).await {
            warn!("Failed to signal {} off: {e}", capture.name());
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        for handle in [self.rotation.take(), self.watchdog.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

fn spawn_peer_event_pump(
    session: Weak<Mutex<CallSession>>,
    mut events: mpsc::UnboundedReceiver<PeerConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            let mut session = session.lock().await;
            if session.is_ended() {
                break;
            }
            session.handle_peer_event(event).await;
        }
    });
}
