//! Media collaborator seams.
//!
//! The call engine drives a peer connection and local capture devices but
//! does not implement them. A real client plugs in its WebRTC stack here;
//! [`crate::loopback`] provides an in-memory stand-in.

use anyhow::Result;
use async_trait::async_trait;
use callcore::ice::IceServer;
use callcore::signaling::{IceCandidate, SessionDescription};
use callcore::types::call::MediaKind;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Transient; ICE may recover.
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` end the call. `Disconnected` does not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Release the underlying capture device.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Per-frame hook run by the media pipeline on every encoded frame.
pub trait FrameTransform: Send + Sync {
    fn transform(&self, frame: &[u8]) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait RtpSender: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Option<Arc<dyn MediaTrack>>;
    /// Swap the outgoing track without renegotiating.
    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<()>;
    fn set_transform(&self, transform: Arc<dyn FrameTransform>) -> Result<()>;
}

pub trait RtpReceiver: Send + Sync {
    fn id(&self) -> &str;
    fn track(&self) -> Arc<dyn MediaTrack>;
    fn set_transform(&self, transform: Arc<dyn FrameTransform>) -> Result<()>;
}

pub enum PeerConnectionEvent {
    IceCandidate(IceCandidate),
    Track(Arc<dyn RtpReceiver>),
    ConnectionStateChanged(ConnectionState),
}

impl fmt::Debug for PeerConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::Track(r) => f.debug_tuple("Track").field(&r.id()).finish(),
            Self::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<Arc<dyn RtpSender>>;
    fn remove_track(&self, sender: &dyn RtpSender) -> Result<()>;
    fn senders(&self) -> Vec<Arc<dyn RtpSender>>;
    fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>>;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn close(&self);
}

/// Creates a peer connection and the stream of its events.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerConnectionEvent>,
    )>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn microphone(&self) -> Result<Arc<dyn MediaTrack>>;
    async fn camera(&self) -> Result<Arc<dyn MediaTrack>>;
    async fn screen(&self) -> Result<Arc<dyn MediaTrack>>;
    /// A live audio track carrying silence (zero-gain oscillator), used
    /// while muted so the audio leg is never negotiated away.
    fn silent_audio(&self) -> Arc<dyn MediaTrack>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_failed_and_closed_are_terminal() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
    }
}
