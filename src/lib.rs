//! End-to-end encrypted peer-to-peer calls over an untrusted signaling relay.
//!
//! Protocol types, cryptography and the call state machine live in
//! [`callcore`]; this crate adds the async runtime pieces.

pub use callcore;

pub mod calls;
pub mod config;
pub mod http;
pub mod ice;
pub mod keys;
pub mod loopback;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use calls::{CallError, CallEvent, CallEventHandler, CallManager, SignalingRouter};
pub use config::CallConfig;
pub use signaling::{SignalSender, SignalingClient, SignalingError};
