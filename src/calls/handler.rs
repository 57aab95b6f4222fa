//! Inbound signaling dispatch.

use super::manager::{CallManager, SessionHandle};
use callcore::signaling::{SignalEnvelope, SignalMessage};
use callcore::types::call::UserId;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Routes every envelope delivered by the relay to the session for its
/// sender.
#[derive(Clone)]
pub struct SignalingRouter {
    manager: Arc<CallManager>,
}

impl SignalingRouter {
    pub fn new(manager: Arc<CallManager>) -> Self {
        Self { manager }
    }

    /// Process envelopes in delivery order until the stream closes.
    pub fn spawn(self, mut inbound: mpsc::UnboundedReceiver<SignalEnvelope>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                self.dispatch(envelope).await;
            }
            info!("Signaling stream closed, router stopped");
        })
    }

    async fn existing(&self, from: &UserId, kind: &str) -> Option<SessionHandle> {
        let session = self.manager.live_session(from).await;
        if session.is_none() {
            debug!("Dropping {kind} from {from}: no call in progress");
        }
        session
    }

    pub async fn dispatch(&self, envelope: SignalEnvelope) {
        let SignalEnvelope {
            from_user_id: from,
            to_user_id: to,
            message,
        } = envelope;
        if &to != self.manager.local_user() {
            warn!("Dropping {} addressed to {to}", message.kind());
            return;
        }
        let kind = message.kind();
        debug!("<-- {kind} from {from}");

        match message {
            SignalMessage::CallInvite { from_username } => {
                let session = self.manager.session_or_incoming(&from).await;
                session.lock().await.on_invite(from_username);
            }
            SignalMessage::CallAccept {} => {
                if let Some(session) = self.existing(&from, kind).await {
                    session.lock().await.on_remote_accept().await;
                }
            }
            SignalMessage::CallReject {} => {
                if let Some(session) = self.existing(&from, kind).await {
                    session.lock().await.on_remote_reject().await;
                }
            }
            SignalMessage::CallOffer(offer) => {
                let session = self.manager.session_or_incoming(&from).await;
                session.lock().await.on_offer(offer).await;
            }
            SignalMessage::CallAnswer(answer) => {
                if let Some(session) = self.existing(&from, kind).await {
                    session.lock().await.on_answer(answer).await;
                }
            }
            SignalMessage::CallIceCandidate(candidate) => {
                let session = self.manager.session_or_incoming(&from).await;
                session.lock().await.on_remote_candidate(candidate).await;
            }
            SignalMessage::CallEnd {} => {
                if let Some(session) = self.existing(&from, kind).await {
                    session.lock().await.on_remote_end().await;
                }
            }
            SignalMessage::CallSessionKey(payload) => {
                let session = self.manager.session_or_incoming(&from).await;
                session.lock().await.on_session_key(payload).await;
            }
            SignalMessage::CallVideoToggle { enabled } => {
                if let Some(session) = self.existing(&from, kind).await {
                    session.lock().await.on_remote_video_toggle(enabled);
                }
            }
            SignalMessage::CallScreenShareToggle { enabled } => {
                if let Some(session) = self.existing(&from, kind).await {
                    session.lock().await.on_remote_screen_share_toggle(enabled);
                }
            }
        }
    }
}
