//! Runtime-agnostic building blocks of the call engine: identifiers, the
//! signaling wire format, session-key cryptography, the call state machine
//! and track classification.

pub mod crypto;
pub mod ice;
pub mod net;
pub mod signaling;
pub mod state;
pub mod track_router;
pub mod types;

pub use crypto::{FrameCryptoError, KeyExchangeError, KeyFingerprint, SessionKey};
pub use signaling::{SignalEnvelope, SignalMessage};
pub use state::{CallInfo, CallState, CallTransition, InvalidTransition};
pub use track_router::TrackRouter;
pub use types::call::{CallRole, EndCallReason, MediaKind, SessionId, TrackClass, UserId};
