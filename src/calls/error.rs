//! Call-related error types.

use super::media::ConnectionState;
use crate::signaling::SignalingError;
use callcore::crypto::KeyExchangeError;
use callcore::types::call::EndCallReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// Camera, microphone or screen capture denied or unavailable.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[source] anyhow::Error),

    #[error("signaling timed out")]
    SignalingTimeout(#[source] SignalingError),

    #[error("signaling failed: {0}")]
    Signaling(#[source] SignalingError),

    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] KeyExchangeError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[source] anyhow::Error),

    /// The peer connection reached `Failed` or `Closed`.
    #[error("peer connection is {0:?}")]
    TransportTerminal(ConnectionState),

    /// Encryption could not be attached to a video or screen-share endpoint.
    #[error("frame encryption binding failed for {endpoint}: {reason}")]
    FrameBinding { endpoint: String, reason: String },

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] callcore::state::InvalidTransition),

    #[error("no session key established")]
    NoSessionKey,
}

impl CallError {
    /// The reason a call torn down by this error ends with.
    pub fn end_reason(&self) -> EndCallReason {
        match self {
            Self::SignalingTimeout(_) | Self::Signaling(_) => EndCallReason::SignalingFailed,
            Self::KeyExchange(_) | Self::FrameBinding { .. } | Self::NoSessionKey => {
                EndCallReason::KeyExchangeFailed
            }
            Self::TransportTerminal(_) => EndCallReason::TransportFailed,
            Self::MediaAcquisition(_)
            | Self::Negotiation(_)
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::InvalidTransition(_) => EndCallReason::NegotiationFailed,
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        match e {
            SignalingError::Timeout(_) => Self::SignalingTimeout(e),
            other => Self::Signaling(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_maps_to_signaling_timeout() {
        let err: CallError = SignalingError::Timeout(Duration::from_secs(10)).into();
        assert!(matches!(err, CallError::SignalingTimeout(_)));

        let err: CallError = SignalingError::NotConnected.into();
        assert!(matches!(err, CallError::Signaling(_)));
    }

    #[test]
    fn test_end_reasons() {
        let err = CallError::TransportTerminal(ConnectionState::Failed);
        assert_eq!(err.end_reason(), EndCallReason::TransportFailed);
        assert_eq!(err.to_string(), "peer connection is Failed");
        let err: CallError = SignalingError::Timeout(Duration::from_secs(10)).into();
        assert_eq!(err.end_reason(), EndCallReason::SignalingFailed);
        assert_eq!(
            CallError::NoSessionKey.end_reason(),
            EndCallReason::KeyExchangeFailed
        );
    }
}
