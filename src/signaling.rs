//! Request/response client for the signaling relay.
//!
//! Every outbound envelope is wrapped in a `request` frame carrying a unique
//! id. The relay answers with `ack` once it has forwarded the envelope, or
//! `error` if it could not. Envelopes from peers arrive as `deliver` frames.
//!
//! ```json
//! {"kind":"request","id":"a1b2-0","envelope":{...}}
//! {"kind":"ack","id":"a1b2-0"}
//! {"kind":"error","id":"a1b2-0","message":"recipient offline"}
//! {"kind":"deliver","envelope":{...}}
//! ```

use async_trait::async_trait;
use callcore::net::{Transport, TransportEvent, TransportFactory};
use callcore::signaling::{SignalEnvelope, SignalMessage};
use callcore::types::call::UserId;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling request timed out after {0:?}")]
    Timeout(Duration),
    #[error("signaling transport is not connected")]
    NotConnected,
    #[error("relay rejected request: {0}")]
    Rejected(String),
    #[error("failed to encode signaling frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
}

/// Frames exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayFrame {
    Request { id: String, envelope: SignalEnvelope },
    Ack { id: String },
    Error { id: String, message: String },
    Deliver { envelope: SignalEnvelope },
}

/// Outbound half of signaling as seen by a call session.
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Send one message and wait for the relay to acknowledge it.
    async fn send_signal(&self, to: &UserId, message: SignalMessage)
    -> Result<(), SignalingError>;
}

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), SignalingError>>>>>;

pub struct SignalingClient {
    local_user: UserId,
    transport: Arc<dyn Transport>,
    response_waiters: Waiters,
    id_counter: AtomicU64,
    unique_id: String,
    request_timeout: Duration,
    is_connected: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Open a transport and start the read pump. Returns the client and the
    /// stream of envelopes delivered by peers.
    pub async fn connect(
        factory: &dyn TransportFactory,
        local_user: UserId,
        request_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalEnvelope>), SignalingError> {
        let (transport, events) = factory.create_transport().await?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            local_user,
            transport,
            response_waiters: Arc::new(Mutex::new(HashMap::new())),
            id_counter: AtomicU64::new(0),
            unique_id: hex::encode(rand::random::<[u8; 4]>()),
            request_timeout,
            is_connected: Arc::new(AtomicBool::new(true)),
        });

        tokio::spawn(read_pump(
            events,
            client.response_waiters.clone(),
            client.is_connected.clone(),
            inbound_tx,
        ));

        Ok((client, inbound_rx))
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    pub fn generate_request_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    pub async fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let req_id = self.generate_request_id();
        let kind = envelope.message.kind();
        let frame = serde_json::to_vec(&RelayFrame::Request {
            id: req_id.clone(),
            envelope,
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.response_waiters.lock().await;
            // a disconnect may have drained the waiters since the check above
            if !self.is_connected() {
                return Err(SignalingError::NotConnected);
            }
            waiters.insert(req_id.clone(), tx);
        }

        debug!("--> {kind} (request {req_id})");
        if let Err(e) = self.transport.send(&frame).await {
            self.response_waiters.lock().await.remove(&req_id);
            return Err(SignalingError::Transport(e));
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::ChannelClosed),
            Err(_) => {
                self.response_waiters.lock().await.remove(&req_id);
                warn!("Signaling request {req_id} ({kind}) timed out");
                Err(SignalingError::Timeout(self.request_timeout))
            }
        }
    }

    pub async fn disconnect(&self) {
        self.is_connected.store(false, Ordering::Relaxed);
        self.transport.disconnect().await;
        fail_all_waiters(&self.response_waiters).await;
    }
}

#[async_trait]
impl SignalSender for SignalingClient {
    async fn send_signal(
        &self,
        to: &UserId,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        self.send(SignalEnvelope::new(
            self.local_user.clone(),
            to.clone(),
            message,
        ))
        .await
    }
}

async fn fail_all_waiters(waiters: &Waiters) {
    for (_, waiter) in waiters.lock().await.drain() {
        let _ = waiter.send(Err(SignalingError::NotConnected));
    }
}

async fn read_pump(
    mut events: mpsc::Receiver<TransportEvent>,
    waiters: Waiters,
    is_connected: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<SignalEnvelope>,
) {
    while let Some(event) = events.recv().await {
        let data = match event {
            TransportEvent::Connected => {
                debug!("Signaling transport connected");
                continue;
            }
            TransportEvent::Disconnected => break,
            TransportEvent::DataReceived(data) => data,
        };

        let frame: RelayFrame = match serde_json::from_slice(&data) {
            Ok(f) => f,
            Err(e) => {
                warn!("Dropping malformed relay frame: {e}");
                continue;
            }
        };

        match frame {
            RelayFrame::Ack { id } => resolve(&waiters, &id, Ok(())).await,
            RelayFrame::Error { id, message } => {
                resolve(&waiters, &id, Err(SignalingError::Rejected(message))).await
            }
            RelayFrame::Deliver { envelope } => {
                debug!(
                    "<-- {} from {}",
                    envelope.message.kind(),
                    envelope.from_user_id
                );
                if inbound_tx.send(envelope).is_err() {
                    debug!("Inbound envelope receiver dropped");
                }
            }
            RelayFrame::Request { id, .. } => {
                warn!("Relay sent a request frame ({id}); ignoring");
            }
        }
    }

    debug!("Signaling transport closed");
    is_connected.store(false, Ordering::Relaxed);
    fail_all_waiters(&waiters).await;
}

async fn resolve(waiters: &Waiters, id: &str, result: Result<(), SignalingError>) {
    match waiters.lock().await.remove(id) {
        Some(waiter) => {
            if waiter.send(result).is_err() {
                debug!("Waiter for request {id} was dropped");
            }
        }
        None => debug!("No waiter for relay response {id}"),
    }
}
