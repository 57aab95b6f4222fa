use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a chat user as known to the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Random per-call correlation token. Bound into every encrypted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Transport-level kind of a media track.
///
/// Camera and screen capture are both `Video` on the wire; see
/// [`crate::TrackRouter`] for how they are told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            _ => Err(()),
        }
    }
}

/// What an incoming track carries once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackClass {
    Audio,
    Video,
    ScreenShare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    /// We sent the invite.
    Initiator,
    /// We received the invite (or the first offer).
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndCallReason {
    /// Local user hung up.
    LocalHangup,
    /// Peer sent `call_end`.
    RemoteHangup,
    /// Local user declined the invite.
    Declined,
    /// Peer declined our invite.
    Rejected,
    /// Peer connection reached `failed` or `closed`.
    TransportFailed,
    /// A signaling round-trip failed while establishing the call.
    SignalingFailed,
    /// SDP creation or application failed.
    NegotiationFailed,
    /// Key wrap/unwrap or key confirmation failed.
    KeyExchangeFailed,
    /// Client shut down with the call still live.
    Shutdown,
}

impl fmt::Display for EndCallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LocalHangup => "local_hangup",
            Self::RemoteHangup => "remote_hangup",
            Self::Declined => "declined",
            Self::Rejected => "rejected",
            Self::TransportFailed => "transport_failed",
            Self::SignalingFailed => "signaling_failed",
            Self::NegotiationFailed => "negotiation_failed",
            Self::KeyExchangeFailed => "key_exchange_failed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_hex_roundtrip() {
        let id = SessionId::generate();
        let parsed = SessionId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), 32);
    }

    #[test]
    fn test_session_id_rejects_bad_hex() {
        assert!(SessionId::from_hex("zz").is_none());
        assert!(SessionId::from_hex("abcd").is_none());
    }

    #[test]
    fn test_media_kind_parsing() {
        assert_eq!("audio".parse(), Ok(MediaKind::Audio));
        assert_eq!("video".parse(), Ok(MediaKind::Video));
        assert!("screen".parse::<MediaKind>().is_err());
    }
}
