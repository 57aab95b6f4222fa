//! Call state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::call::{CallRole, EndCallReason, SessionId, UserId};

/// Current state of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    /// Session object exists but nothing has been exchanged yet.
    #[default]
    Idle,
    /// Outgoing: invite sent, waiting for the peer to answer.
    Inviting { invited_at: DateTime<Utc> },
    /// Incoming: invite received, ringing locally.
    Ringing { received_at: DateTime<Utc> },
    /// Both sides agreed to talk; key exchange and the first offer follow.
    Accepted { accepted_at: DateTime<Utc> },
    /// First offer/answer exchange in flight.
    Negotiating { started_at: DateTime<Utc> },
    /// Media path established.
    Active { connected_at: DateTime<Utc> },
    Ended {
        reason: EndCallReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. } | Self::Inviting { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Ringing { .. } | Self::Inviting { .. })
    }

    /// Short name used in logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Inviting { .. } => "inviting",
            Self::Ringing { .. } => "ringing",
            Self::Accepted { .. } => "accepted",
            Self::Negotiating { .. } => "negotiating",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }
}

/// Events that move a call between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    InviteSent,
    InviteReceived,
    /// The peer's invite arrived while ours was outstanding and we yield:
    /// the call continues with us as the receiver.
    InviteCrossed,
    RemoteAccepted,
    LocalAccepted,
    OfferSent,
    OfferReceived,
    /// Initiator applied the peer's answer.
    AnswerApplied,
    /// Receiver sent its answer.
    AnswerSent,
    Terminated { reason: EndCallReason },
}

#[derive(Debug, Clone, Error)]
#[error("invalid transition {attempted} in state {current_state}")]
pub struct InvalidTransition {
    pub current_state: &'static str,
    pub attempted: String,
}

/// Identity and lifecycle of one call with one peer.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub peer: UserId,
    pub peer_username: Option<String>,
    pub role: CallRole,
    #[serde(skip)]
    pub session_id: SessionId,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallInfo {
    pub fn new_outgoing(peer: UserId) -> Self {
        Self {
            peer,
            peer_username: None,
            role: CallRole::Initiator,
            session_id: SessionId::generate(),
            state: CallState::Idle,
            created_at: Utc::now(),
        }
    }

    pub fn new_incoming(peer: UserId, peer_username: Option<String>) -> Self {
        Self {
            peer,
            peer_username,
            role: CallRole::Receiver,
            session_id: SessionId::generate(),
            state: CallState::Idle,
            created_at: Utc::now(),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Initiator
    }

    /// Apply a state transition. Returns error if transition is invalid.
    ///
    /// Offers and answers exchanged while `Active` are renegotiations and
    /// leave the state untouched.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::InviteSent) => CallState::Inviting { invited_at: now },
            (CallState::Idle, CallTransition::InviteReceived) => {
                CallState::Ringing { received_at: now }
            }
            (CallState::Inviting { .. }, CallTransition::InviteCrossed) => {
                self.role = CallRole::Receiver;
                CallState::Ringing { received_at: now }
            }
            (CallState::Inviting { .. }, CallTransition::RemoteAccepted)
            | (CallState::Ringing { .. }, CallTransition::LocalAccepted) => {
                CallState::Accepted { accepted_at: now }
            }
            (CallState::Accepted { .. }, CallTransition::OfferSent)
            | (CallState::Accepted { .. } | CallState::Idle, CallTransition::OfferReceived) => {
                CallState::Negotiating { started_at: now }
            }
            (
                CallState::Negotiating { .. },
                CallTransition::AnswerApplied | CallTransition::AnswerSent,
            ) => CallState::Active { connected_at: now },
            (
                CallState::Active { connected_at },
                CallTransition::OfferSent
                | CallTransition::OfferReceived
                | CallTransition::AnswerApplied
                | CallTransition::AnswerSent,
            ) => CallState::Active {
                connected_at: *connected_at,
            },
            (CallState::Active { connected_at }, CallTransition::Terminated { reason }) => {
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: Some(now.signed_duration_since(*connected_at).num_seconds()),
                }
            }
            (current, CallTransition::Terminated { reason }) if !current.is_ended() => {
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name(),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_outgoing_call() -> CallInfo {
        CallInfo::new_outgoing(UserId::from("7"))
    }

    fn make_incoming_call() -> CallInfo {
        CallInfo::new_incoming(UserId::from("3"), Some("alice".to_string()))
    }

    #[test]
    fn test_crossed_invite_turns_caller_into_receiver() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::InviteSent).unwrap();

        call.apply_transition(CallTransition::InviteCrossed).unwrap();

        assert!(matches!(call.state, CallState::Ringing { .. }));
        assert!(!call.is_initiator());
        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert!(make_incoming_call()
            .apply_transition(CallTransition::InviteCrossed)
            .is_err());
    }

    /// Flow: Idle → Inviting → Accepted → Negotiating → Active → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();
        assert!(call.is_initiator());
        assert_eq!(call.state, CallState::Idle);

        call.apply_transition(CallTransition::InviteSent).unwrap();
        assert!(call.state.is_ringing());

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert!(matches!(call.state, CallState::Accepted { .. }));

        call.apply_transition(CallTransition::OfferSent).unwrap();
        assert!(matches!(call.state, CallState::Negotiating { .. }));

        call.apply_transition(CallTransition::AnswerApplied).unwrap();
        assert!(call.state.is_active());

        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::LocalHangup,
        })
        .unwrap();
        match call.state {
            CallState::Ended { duration_secs, .. } => assert!(duration_secs.is_some()),
            other => panic!("expected ended, got {other:?}"),
        }
    }

    /// Flow: Idle → Ringing → Accepted → Negotiating → Active
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();
        assert!(!call.is_initiator());

        call.apply_transition(CallTransition::InviteReceived).unwrap();
        assert!(call.state.can_accept());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        call.apply_transition(CallTransition::OfferReceived).unwrap();
        call.apply_transition(CallTransition::AnswerSent).unwrap();
        assert!(call.state.is_active());
    }

    #[test]
    fn test_offer_without_invite_is_accepted() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::OfferReceived).unwrap();
        assert!(matches!(call.state, CallState::Negotiating { .. }));
    }

    #[test]
    fn test_renegotiation_keeps_active() {
        let mut call = make_outgoing_call();
        for t in [
            CallTransition::InviteSent,
            CallTransition::RemoteAccepted,
            CallTransition::OfferSent,
            CallTransition::AnswerApplied,
        ] {
            call.apply_transition(t).unwrap();
        }
        let before = call.state.clone();

        call.apply_transition(CallTransition::OfferSent).unwrap();
        call.apply_transition(CallTransition::AnswerApplied).unwrap();
        call.apply_transition(CallTransition::OfferReceived).unwrap();
        call.apply_transition(CallTransition::AnswerSent).unwrap();

        assert_eq!(call.state, before);
    }

    #[test]
    fn test_rejected_while_inviting() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::InviteSent).unwrap();
        assert!(call.state.can_reject());

        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Rejected,
        })
        .unwrap();

        match call.state {
            CallState::Ended {
                reason,
                duration_secs,
                ..
            } => {
                assert_eq!(reason, EndCallReason::Rejected);
                assert!(duration_secs.is_none());
            }
            other => panic!("expected ended, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing_call();
        assert!(call.apply_transition(CallTransition::RemoteAccepted).is_err());
        assert!(call.apply_transition(CallTransition::AnswerApplied).is_err());

        call.apply_transition(CallTransition::InviteSent).unwrap();
        let err = call.apply_transition(CallTransition::OfferSent).unwrap_err();
        assert_eq!(err.current_state, "inviting");
        assert!(err.to_string().contains("OfferSent"));
    }

    #[test]
    fn test_ended_call_rejects_transitions() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::InviteReceived).unwrap();
        call.apply_transition(CallTransition::Terminated {
            reason: EndCallReason::Declined,
        })
        .unwrap();
        assert!(call.state.is_ended());

        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
        assert!(
            call.apply_transition(CallTransition::Terminated {
                reason: EndCallReason::LocalHangup,
            })
            .is_err()
        );
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let a = make_outgoing_call();
        let b = make_outgoing_call();
        assert_ne!(a.session_id, b.session_id);
    }
}
