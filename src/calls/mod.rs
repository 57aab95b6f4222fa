//! Encrypted one-to-one calls.
//!
//! # Architecture
//!
//! - [`CallManager`]: registry of sessions keyed by remote user
//! - [`CallSession`]: one call; owns the peer connection, local media and keys
//! - [`SignalingRouter`]: dispatches inbound envelopes to sessions
//! - [`encryption`]: binds per-frame encrypt/decrypt transforms to endpoints
//! - [`media`]: the peer-connection and capture seams a client implements
//!
//! # Flow
//!
//! The initiator sends `call_invite`. Once the peer answers with
//! `call_accept`, the initiator generates a session key, wraps it for the
//! peer and sends it in `call_session_key`, then sends the first offer. The
//! peer unwraps and confirms the key before answering, so every media
//! endpoint is bound to the key before frames flow.

mod context;
pub mod encryption;
mod error;
pub mod events;
mod handler;
mod manager;
pub mod media;
mod session;

pub use context::CallContext;
pub use encryption::KeyOrigin;
pub use error::CallError;
pub use events::{CallEvent, CallEventBus, CallEventHandler};
pub use handler::SignalingRouter;
pub use manager::{CallManager, SessionHandle};
pub use session::CallSession;
