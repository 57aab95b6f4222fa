//! Notifications from the call engine to the UI.

use super::media::{ConnectionState, MediaTrack};
use callcore::crypto::KeyFingerprint;
use callcore::types::call::{EndCallReason, UserId};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub enum CallEvent {
    IncomingCall {
        peer: UserId,
        username: String,
    },
    CallAccepted {
        peer: UserId,
    },
    CallActive {
        peer: UserId,
    },
    CallEnded {
        peer: UserId,
        reason: EndCallReason,
    },
    RemoteAudio {
        peer: UserId,
        track: Arc<dyn MediaTrack>,
    },
    RemoteVideo {
        peer: UserId,
        track: Arc<dyn MediaTrack>,
    },
    RemoteScreenShare {
        peer: UserId,
        track: Arc<dyn MediaTrack>,
    },
    RemoteVideoToggled {
        peer: UserId,
        enabled: bool,
    },
    RemoteScreenShareToggled {
        peer: UserId,
        enabled: bool,
    },
    /// Emoji rendering of the installed session key, to compare out of band.
    KeyFingerprint {
        peer: UserId,
        fingerprint: KeyFingerprint,
    },
    ConnectionState {
        peer: UserId,
        state: ConnectionState,
    },
}

impl CallEvent {
    pub fn peer(&self) -> &UserId {
        match self {
            Self::IncomingCall { peer, .. }
            | Self::CallAccepted { peer }
            | Self::CallActive { peer }
            | Self::CallEnded { peer, .. }
            | Self::RemoteAudio { peer, .. }
            | Self::RemoteVideo { peer, .. }
            | Self::RemoteScreenShare { peer, .. }
            | Self::RemoteVideoToggled { peer, .. }
            | Self::RemoteScreenShareToggled { peer, .. }
            | Self::KeyFingerprint { peer, .. }
            | Self::ConnectionState { peer, .. } => peer,
        }
    }
}

pub trait CallEventHandler: Send + Sync {
    fn handle_event(&self, event: &CallEvent);
}

#[derive(Default, Clone)]
pub struct CallEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn CallEventHandler>>>>,
}

impl CallEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn CallEventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    pub fn dispatch(&self, event: &CallEvent) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}
