//! Call signaling wire format.
//!
//! Every message travels as a JSON envelope addressed by `fromUserId` /
//! `toUserId`, with the message kind in `type` and its body in `payload`:
//!
//! ```json
//! {"fromUserId":"7","toUserId":"9","type":"call_video_toggle","payload":{"enabled":true}}
//! ```

use crate::crypto::WrappedKeyPayload;
use crate::types::call::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub sdp: String,
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }

    pub fn rollback() -> Self {
        Self {
            sdp: String::new(),
            sdp_type: SdpType::Rollback,
        }
    }
}

/// An ICE candidate relayed between the peers.
///
/// The candidate string follows RFC 5245 (e.g.
/// `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    /// The `typ` field of the candidate line, if present.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next().and_then(|t| t.parse().ok());
            }
        }
        None
    }
}

/// ICE candidate type (RFC 5245).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl std::str::FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// Body of `call_session_key`.
///
/// The hash is always present once a key exists. Wrapped material is only
/// present while distributing (initially or after rotation); a message with
/// the hash alone confirms which key the sender installed.
///
/// `key_epoch` names the frame epoch the key belongs to. Receivers install
/// the key at exactly that epoch so both sides keep the same numbering even
/// when a distribution is retried or delivered twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKeyPayload {
    pub session_key_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_session_key: Option<WrappedKeyPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_epoch: Option<u32>,
}

/// The fixed set of call signaling messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalMessage {
    CallInvite {
        #[serde(rename = "fromUsername")]
        from_username: String,
    },
    CallAccept {},
    CallReject {},
    CallOffer(SessionDescription),
    CallAnswer(SessionDescription),
    CallIceCandidate(IceCandidate),
    CallEnd {},
    CallSessionKey(SessionKeyPayload),
    CallVideoToggle {
        enabled: bool,
    },
    CallScreenShareToggle {
        enabled: bool,
    },
}

impl SignalMessage {
    /// The wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallInvite { .. } => "call_invite",
            Self::CallAccept {} => "call_accept",
            Self::CallReject {} => "call_reject",
            Self::CallOffer(_) => "call_offer",
            Self::CallAnswer(_) => "call_answer",
            Self::CallIceCandidate(_) => "call_ice_candidate",
            Self::CallEnd {} => "call_end",
            Self::CallSessionKey(_) => "call_session_key",
            Self::CallVideoToggle { .. } => "call_video_toggle",
            Self::CallScreenShareToggle { .. } => "call_screen_share_toggle",
        }
    }
}

impl fmt::Display for SignalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    #[serde(flatten)]
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(from: UserId, to: UserId, message: SignalMessage) -> Self {
        Self {
            from_user_id: from,
            to_user_id: to,
            message,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(message: SignalMessage) -> SignalEnvelope {
        SignalEnvelope::new(UserId::from("7"), UserId::from("9"), message)
    }

    #[test]
    fn test_invite_wire_shape() {
        let env = envelope(SignalMessage::CallInvite {
            from_username: "alice".to_string(),
        });
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "fromUserId": "7",
                "toUserId": "9",
                "type": "call_invite",
                "payload": {"fromUsername": "alice"}
            })
        );
    }

    #[test]
    fn test_parses_toggle_from_peer_json() {
        let raw = r#"{"fromUserId":"9","toUserId":"7","type":"call_screen_share_toggle","payload":{"enabled":true}}"#;
        let env = SignalEnvelope::from_json(raw).unwrap();
        assert_eq!(env.from_user_id.as_str(), "9");
        assert_eq!(
            env.message,
            SignalMessage::CallScreenShareToggle { enabled: true }
        );
    }

    #[test]
    fn test_parses_empty_payload_messages() {
        let raw = r#"{"fromUserId":"9","toUserId":"7","type":"call_end","payload":{}}"#;
        let env = SignalEnvelope::from_json(raw).unwrap();
        assert_eq!(env.message, SignalMessage::CallEnd {});
        assert_eq!(env.message.kind(), "call_end");
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let env = envelope(SignalMessage::CallIceCandidate(
            IceCandidate::new("candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host")
                .with_sdp_mid("0")
                .with_sdp_m_line_index(0),
        ));
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_session_key_without_wrapped_material() {
        let raw = r#"{"fromUserId":"9","toUserId":"7","type":"call_session_key","payload":{"sessionKeyHash":"q83vEg=="}}"#;
        let env = SignalEnvelope::from_json(raw).unwrap();
        match env.message {
            SignalMessage::CallSessionKey(payload) => {
                assert_eq!(payload.session_key_hash, "q83vEg==");
                assert!(payload.wrapped_session_key.is_none());
                assert!(payload.session_id.is_none());
                assert!(payload.key_epoch.is_none());
            }
            other => panic!("expected session key, got {other:?}"),
        }
    }

    #[test]
    fn test_session_key_epoch_field_name() {
        let raw = r#"{"fromUserId":"9","toUserId":"7","type":"call_session_key","payload":{"sessionKeyHash":"q83vEg==","keyEpoch":3}}"#;
        let env = SignalEnvelope::from_json(raw).unwrap();
        match &env.message {
            SignalMessage::CallSessionKey(payload) => assert_eq!(payload.key_epoch, Some(3)),
            other => panic!("expected session key, got {other:?}"),
        }
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["payload"]["keyEpoch"], 3);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"fromUserId":"9","toUserId":"7","type":"call_hold","payload":{}}"#;
        assert!(SignalEnvelope::from_json(raw).is_err());
    }

    #[test]
    fn test_candidate_type_parsing() {
        let c = IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.5 61000 typ srflx raddr 0.0.0.0 rport 0");
        assert_eq!(c.candidate_type(), Some(CandidateType::ServerReflexive));
        assert_eq!(IceCandidate::new("garbage").candidate_type(), None);
        assert_eq!(CandidateType::Relay.as_str(), "relay");
    }
}
