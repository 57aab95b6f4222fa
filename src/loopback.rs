//! In-memory collaborators: a signaling relay, capture devices, and peer
//! connections that exchange a minimal SDP listing their senders.
//!
//! Used by the demo binary and the tests. Two [`crate::calls::CallManager`]s
//! wired to the same [`LoopbackRelay`] can run a complete call inside one
//! process, including per-frame encryption through the bound transforms.

use crate::calls::events::{CallEvent, CallEventHandler};
use crate::calls::media::{
    ConnectionState, FrameTransform, MediaDevices, MediaTrack, PeerConnection,
    PeerConnectionEvent, PeerConnectionFactory, RtpReceiver, RtpSender, SignalingState,
};
use crate::signaling::RelayFrame;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use callcore::ice::IceServer;
use callcore::net::{Transport, TransportEvent, TransportFactory};
use callcore::signaling::{IceCandidate, SdpType, SessionDescription, SignalEnvelope};
use callcore::types::call::{MediaKind, UserId};
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

// Tracks and devices

#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    silent: bool,
    stopped: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(kind: MediaKind) -> Arc<Self> {
        Self::with_id(next_id(kind.as_str()), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            silent: false,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            id: next_id("silence"),
            kind: MediaKind::Audio,
            silent: true,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Microphone,
    Camera,
    Screen,
}

/// Capture devices that always succeed unless denied.
#[derive(Default)]
pub struct LoopbackDevices {
    denied: Mutex<HashSet<Device>>,
    issued: Mutex<Vec<(Device, Arc<LoopbackTrack>)>>,
}

impl LoopbackDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, device: Device) {
        self.denied.lock().unwrap_or_else(|e| e.into_inner()).insert(device);
    }

    pub fn allow(&self, device: Device) {
        self.denied.lock().unwrap_or_else(|e| e.into_inner()).remove(&device);
    }

    /// Every track handed out so far, in order.
    pub fn issued(&self, device: Device) -> Vec<Arc<LoopbackTrack>> {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(d, _)| *d == device)
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn acquire(&self, device: Device) -> Result<Arc<dyn MediaTrack>> {
        if self
            .denied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&device)
        {
            bail!("{device:?} permission denied");
        }
        let track = match device {
            Device::Microphone => LoopbackTrack::with_id(next_id("mic"), MediaKind::Audio),
            Device::Camera => LoopbackTrack::with_id(next_id("camera"), MediaKind::Video),
            Device::Screen => LoopbackTrack::with_id(next_id("screen"), MediaKind::Video),
        };
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((device, track.clone()));
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn microphone(&self) -> Result<Arc<dyn MediaTrack>> {
        self.acquire(Device::Microphone)
    }

    async fn camera(&self) -> Result<Arc<dyn MediaTrack>> {
        self.acquire(Device::Camera)
    }

    async fn screen(&self) -> Result<Arc<dyn MediaTrack>> {
        self.acquire(Device::Screen)
    }

    fn silent_audio(&self) -> Arc<dyn MediaTrack> {
        LoopbackTrack::silent()
    }
}

// Senders and receivers

type FailingKinds = Arc<Mutex<HashSet<MediaKind>>>;

fn install_transform(
    slot: &Mutex<Option<Arc<dyn FrameTransform>>>,
    installs: &AtomicUsize,
    failing: &FailingKinds,
    kind: MediaKind,
    transform: Arc<dyn FrameTransform>,
) -> Result<()> {
    if failing
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains(&kind)
    {
        bail!("transforms unsupported for {} endpoints", kind.as_str());
    }
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(transform);
    installs.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn apply_transform(slot: &Mutex<Option<Arc<dyn FrameTransform>>>, frame: &[u8]) -> Result<Vec<u8>> {
    let transform = slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
    match transform {
        Some(t) => t.transform(frame),
        None => Ok(frame.to_vec()),
    }
}

pub struct LoopbackSender {
    id: String,
    kind: MediaKind,
    track: Mutex<Option<Arc<dyn MediaTrack>>>,
    transform: Mutex<Option<Arc<dyn FrameTransform>>>,
    installs: AtomicUsize,
    failing: FailingKinds,
}

impl LoopbackSender {
    /// Run one outgoing frame through the pipeline and return the wire bytes.
    pub fn push_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        apply_transform(&self.transform, frame)
    }

    pub fn has_transform(&self) -> bool {
        self.transform
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn transform_installs(&self) -> usize {
        self.installs.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RtpSender for LoopbackSender {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.track.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<()> {
        if let Some(t) = &track
            && t.kind() != self.kind
        {
            bail!("cannot replace {} track with {}", self.kind.as_str(), t.kind().as_str());
        }
        *self.track.lock().unwrap_or_else(|e| e.into_inner()) = track;
        Ok(())
    }

    fn set_transform(&self, transform: Arc<dyn FrameTransform>) -> Result<()> {
        install_transform(
            &self.transform,
            &self.installs,
            &self.failing,
            self.kind,
            transform,
        )
    }
}

pub struct LoopbackReceiver {
    id: String,
    track: Arc<LoopbackTrack>,
    transform: Mutex<Option<Arc<dyn FrameTransform>>>,
    installs: AtomicUsize,
    failing: FailingKinds,
}

impl LoopbackReceiver {
    /// Run one incoming wire frame through the pipeline.
    pub fn receive_frame(&self, wire: &[u8]) -> Result<Vec<u8>> {
        apply_transform(&self.transform, wire)
    }

    pub fn transform_installs(&self) -> usize {
        self.installs.load(Ordering::Relaxed)
    }
}

impl RtpReceiver for LoopbackReceiver {
    fn id(&self) -> &str {
        &self.id
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn set_transform(&self, transform: Arc<dyn FrameTransform>) -> Result<()> {
        install_transform(
            &self.transform,
            &self.installs,
            &self.failing,
            self.track.kind(),
            transform,
        )
    }
}

// Peer connection

struct PcInner {
    senders: Vec<Arc<LoopbackSender>>,
    /// Keyed by the remote sender id announced in the peer's SDP.
    receivers: HashMap<String, Arc<LoopbackReceiver>>,
    signaling_state: SignalingState,
    connection_state: ConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    fail_next_offer: bool,
}

/// A peer connection whose SDP is a list of `a=track:<sender-id> <kind>`
/// lines. Applying a remote description creates one receiver per announced
/// sender and reports it as a track event.
pub struct LoopbackPeerConnection {
    id: String,
    inner: Mutex<PcInner>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerConnectionEvent>>>,
    failing: FailingKinds,
}

impl LoopbackPeerConnection {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = Arc::new(Self {
            id: next_id("pc"),
            inner: Mutex::new(PcInner {
                senders: Vec::new(),
                receivers: HashMap::new(),
                signaling_state: SignalingState::Stable,
                connection_state: ConnectionState::New,
                local_description: None,
                remote_description: None,
                remote_candidates: Vec::new(),
                fail_next_offer: false,
            }),
            events: Mutex::new(Some(tx)),
            failing: Arc::new(Mutex::new(HashSet::new())),
        });
        (pc, rx)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, PcInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PeerConnectionEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Report a connection state change as the ICE agent would.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.inner().connection_state = state;
        self.emit(PeerConnectionEvent::ConnectionStateChanged(state));
    }

    /// Make `set_transform` fail for endpoints of this kind.
    pub fn fail_transforms_for(&self, kind: MediaKind) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind);
    }

    pub fn fail_next_offer(&self) {
        self.inner().fail_next_offer = true;
    }

    pub fn loopback_senders(&self) -> Vec<Arc<LoopbackSender>> {
        self.inner().senders.clone()
    }

    pub fn receiver_for(&self, remote_sender_id: &str) -> Option<Arc<LoopbackReceiver>> {
        self.inner().receivers.get(remote_sender_id).cloned()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner().signaling_state == SignalingState::Closed
    }

    /// How many times a transform was installed on the endpoint `id`.
    pub fn transform_installs(&self, id: &str) -> usize {
        let inner = self.inner();
        if let Some(s) = inner.senders.iter().find(|s| s.id == id) {
            return s.transform_installs();
        }
        inner
            .receivers
            .values()
            .find(|r| r.id == id)
            .map(|r| r.transform_installs())
            .unwrap_or(0)
    }

    fn render_sdp(&self, inner: &PcInner) -> String {
        let mut sdp = format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=e2ecall-loopback\r\n", self.id);
        for sender in &inner.senders {
            sdp.push_str(&format!("a=track:{} {}\r\n", sender.id, sender.kind.as_str()));
        }
        sdp
    }

    fn parse_tracks(sdp: &str) -> Vec<(String, MediaKind)> {
        sdp.lines()
            .filter_map(|line| line.trim().strip_prefix("a=track:"))
            .filter_map(|rest| {
                let (id, kind) = rest.split_once(' ')?;
                Some((id.to_string(), kind.parse().ok()?))
            })
            .collect()
    }

    /// Create receivers for newly announced senders and drop vanished ones.
    fn sync_receivers(&self, sdp: &str) {
        let announced = Self::parse_tracks(sdp);
        let mut created = Vec::new();
        {
            let mut inner = self.inner();
            let keep: HashSet<&str> = announced.iter().map(|(id, _)| id.as_str()).collect();
            inner.receivers.retain(|id, receiver| {
                let alive = keep.contains(id.as_str());
                if !alive {
                    receiver.track.stop();
                }
                alive
            });
            for (remote_id, kind) in &announced {
                if inner.receivers.contains_key(remote_id) {
                    continue;
                }
                let receiver = Arc::new(LoopbackReceiver {
                    id: next_id("receiver"),
                    track: LoopbackTrack::with_id(format!("remote-{remote_id}"), *kind),
                    transform: Mutex::new(None),
                    installs: AtomicUsize::new(0),
                    failing: self.failing.clone(),
                });
                inner.receivers.insert(remote_id.clone(), receiver.clone());
                created.push(receiver);
            }
        }
        for receiver in created {
            trace!("{}: new remote track {}", self.id, receiver.track.id());
            self.emit(PeerConnectionEvent::Track(receiver));
        }
    }

    fn connect_if_new(&self) {
        let should_connect = {
            let mut inner = self.inner();
            if inner.connection_state == ConnectionState::New {
                inner.connection_state = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if should_connect {
            self.emit(PeerConnectionEvent::ConnectionStateChanged(
                ConnectionState::Connecting,
            ));
            self.emit(PeerConnectionEvent::ConnectionStateChanged(
                ConnectionState::Connected,
            ));
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            bail!("peer connection {} is closed", self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let mut inner = self.inner();
        if std::mem::take(&mut inner.fail_next_offer) {
            bail!("offer creation failed");
        }
        Ok(SessionDescription::offer(self.render_sdp(&inner)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let inner = self.inner();
        if inner.signaling_state != SignalingState::HaveRemoteOffer {
            bail!("no remote offer to answer");
        }
        Ok(SessionDescription::answer(self.render_sdp(&inner)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let sdp_type = description.sdp_type;
        {
            let mut inner = self.inner();
            inner.signaling_state = match (inner.signaling_state, sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (SignalingState::HaveLocalOffer, SdpType::Rollback) => SignalingState::Stable,
                (state, t) => bail!("cannot apply local {t:?} in {state:?}"),
            };
            if sdp_type == SdpType::Rollback {
                inner.local_description = None;
                return Ok(());
            }
            inner.local_description = Some(description);
        }

        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let port = 40000 + n % 20000;
        self.emit(PeerConnectionEvent::IceCandidate(
            IceCandidate::new(format!(
                "candidate:{n} 1 UDP 2130706431 127.0.0.1 {port} typ host"
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0),
        ));
        if sdp_type == SdpType::Answer {
            self.connect_if_new();
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let sdp_type = description.sdp_type;
        {
            let mut inner = self.inner();
            inner.signaling_state = match (inner.signaling_state, sdp_type) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (state, t) => bail!("cannot apply remote {t:?} in {state:?}"),
            };
            inner.remote_description = Some(description.clone());
        }
        self.sync_receivers(&description.sdp);
        if sdp_type == SdpType::Answer {
            self.connect_if_new();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner();
        if inner.remote_description.is_none() {
            bail!("candidate received before remote description");
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<Arc<dyn RtpSender>> {
        self.ensure_open()?;
        let sender = Arc::new(LoopbackSender {
            id: next_id("sender"),
            kind: track.kind(),
            track: Mutex::new(Some(track)),
            transform: Mutex::new(None),
            installs: AtomicUsize::new(0),
            failing: self.failing.clone(),
        });
        self.inner().senders.push(sender.clone());
        Ok(sender)
    }

    fn remove_track(&self, sender: &dyn RtpSender) -> Result<()> {
        let mut inner = self.inner();
        let before = inner.senders.len();
        inner.senders.retain(|s| s.id != sender.id());
        if inner.senders.len() == before {
            bail!("sender {} does not belong to {}", sender.id(), self.id);
        }
        Ok(())
    }

    fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.inner()
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSender>)
            .collect()
    }

    fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>> {
        self.inner()
            .receivers
            .values()
            .map(|r| r.clone() as Arc<dyn RtpReceiver>)
            .collect()
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner().signaling_state
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner().connection_state
    }

    async fn close(&self) {
        {
            let mut inner = self.inner();
            if inner.signaling_state == SignalingState::Closed {
                return;
            }
            inner.signaling_state = SignalingState::Closed;
            inner.connection_state = ConnectionState::Closed;
            for receiver in inner.receivers.values() {
                receiver.track.stop();
            }
        }
        debug!("{} closed", self.id);
        // closing drops the event stream; no state event is emitted
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Hands out [`LoopbackPeerConnection`]s and remembers them for inspection.
#[derive(Default)]
pub struct LoopbackPeerConnectionFactory {
    created: Mutex<Vec<Arc<LoopbackPeerConnection>>>,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl LoopbackPeerConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connections(&self) -> Vec<Arc<LoopbackPeerConnection>> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Arc<LoopbackPeerConnection>> {
        self.connections().pop()
    }

    /// ICE servers passed to the most recent peer connection.
    pub fn last_ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerConnectionFactory {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerConnectionEvent>,
    )> {
        let (pc, events) = LoopbackPeerConnection::new();
        *self.ice_servers.lock().unwrap_or_else(|e| e.into_inner()) = ice_servers.to_vec();
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pc.clone());
        Ok((pc, events))
    }
}

// Signaling relay

#[derive(Default)]
struct RelayInner {
    clients: HashMap<UserId, mpsc::Sender<TransportEvent>>,
    delivered: Vec<SignalEnvelope>,
    silent: bool,
}

/// Forwards request frames between connected users and acknowledges them,
/// like the production relay does.
#[derive(Default)]
pub struct LoopbackRelay {
    inner: Mutex<RelayInner>,
}

impl LoopbackRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>, user: UserId) -> LoopbackTransportFactory {
        LoopbackTransportFactory {
            relay: self.clone(),
            user,
        }
    }

    /// Swallow requests without acking or forwarding them.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    pub fn delivered(&self) -> Vec<SignalEnvelope> {
        self.lock().delivered.clone()
    }

    /// Number of forwarded messages of `kind` sent by `from`.
    pub fn count(&self, from: &UserId, kind: &str) -> usize {
        self.lock()
            .delivered
            .iter()
            .filter(|e| &e.from_user_id == from && e.message.kind() == kind)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn handle(&self, from: &UserId, data: &[u8]) -> Result<()> {
        let (id, envelope) = match serde_json::from_slice::<RelayFrame>(data)? {
            RelayFrame::Request { id, envelope } => (id, envelope),
            other => bail!("unexpected frame from client: {other:?}"),
        };

        let (sender_tx, recipient_tx) = {
            let mut inner = self.lock();
            if inner.silent {
                trace!("relay: dropping {id}");
                return Ok(());
            }
            let sender_tx = inner
                .clients
                .get(from)
                .cloned()
                .ok_or_else(|| anyhow!("{from} is not connected"))?;
            let recipient_tx = if &envelope.from_user_id == from {
                inner.clients.get(&envelope.to_user_id).cloned()
            } else {
                None
            };
            if recipient_tx.is_some() {
                inner.delivered.push(envelope.clone());
            }
            (sender_tx, recipient_tx)
        };

        let reply = match recipient_tx {
            Some(tx) => {
                let deliver = serde_json::to_vec(&RelayFrame::Deliver { envelope })?;
                let _ = tx.send(TransportEvent::DataReceived(Bytes::from(deliver))).await;
                RelayFrame::Ack { id }
            }
            None => RelayFrame::Error {
                id,
                message: "recipient offline".to_string(),
            },
        };
        let _ = sender_tx
            .send(TransportEvent::DataReceived(Bytes::from(serde_json::to_vec(
                &reply,
            )?)))
            .await;
        Ok(())
    }
}

pub struct LoopbackTransportFactory {
    relay: Arc<LoopbackRelay>,
    user: UserId,
}

#[async_trait]
impl TransportFactory for LoopbackTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (tx, rx) = mpsc::channel(256);
        let _ = tx.send(TransportEvent::Connected).await;
        self.relay.lock().clients.insert(self.user.clone(), tx);
        Ok((
            Arc::new(LoopbackTransport {
                relay: self.relay.clone(),
                user: self.user.clone(),
            }),
            rx,
        ))
    }
}

struct LoopbackTransport {
    relay: Arc<LoopbackRelay>,
    user: UserId,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        self.relay.handle(&self.user, data).await
    }

    async fn disconnect(&self) {
        let tx = self.relay.lock().clients.remove(&self.user);
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }
}

// UI stand-in

/// Records every call event and lets callers wait for one.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<CallEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, pred: impl Fn(&CallEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| pred(e))
            .count()
    }

    /// Wait until an event matching `pred` has been recorded.
    pub async fn wait_for(
        &self,
        pred: impl Fn(&CallEvent) -> bool,
        within: Duration,
    ) -> Option<CallEvent> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self
                .events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .find(|e| pred(e))
                .cloned()
            {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl CallEventHandler for RecordingHandler {
    fn handle_event(&self, event: &CallEvent) {
        debug!("event: {event:?}");
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{SignalSender, SignalingClient, SignalingError};
    use callcore::signaling::SignalMessage;

    #[tokio::test]
    async fn test_offer_answer_creates_receivers() {
        let (a, mut a_events) = LoopbackPeerConnection::new();
        let (b, mut b_events) = LoopbackPeerConnection::new();
        let mic = a.add_track(LoopbackTrack::new(MediaKind::Audio)).unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert!(b.receiver_for(mic.id()).is_some());

        let mut saw_track = false;
        while let Ok(event) = b_events.try_recv() {
            if let PeerConnectionEvent::Track(r) = event {
                assert_eq!(r.track().kind(), MediaKind::Audio);
                saw_track = true;
            }
        }
        assert!(saw_track);
        match a_events.try_recv() {
            Ok(PeerConnectionEvent::IceCandidate(c)) => {
                let fields: Vec<&str> = c.candidate.split(' ').collect();
                assert!(fields[0].starts_with("candidate:"));
                let port: u64 = fields[5].parse().unwrap();
                assert!((40000..60000).contains(&port));
                assert_eq!(&fields[6..], ["typ", "host"]);
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
            }
            _ => panic!("expected a local candidate"),
        }
    }

    #[tokio::test]
    async fn test_rollback_and_state_errors() {
        let (pc, _events) = LoopbackPeerConnection::new();
        assert!(pc.create_answer().await.is_err());

        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer).await.unwrap();
        pc.set_local_description(SessionDescription::rollback())
            .await
            .unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::Stable);

        assert!(
            pc.add_ice_candidate(IceCandidate::new("candidate:1 1 UDP 1 1.1.1.1 1 typ host"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_use() {
        let (pc, mut events) = LoopbackPeerConnection::new();
        pc.close().await;
        pc.close().await;
        assert!(pc.is_closed());
        assert!(pc.create_offer().await.is_err());
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_relay_forwards_and_acks() {
        let relay = LoopbackRelay::new();
        let (alice, _a_rx) = SignalingClient::connect(
            &relay.factory(UserId::from("1")),
            UserId::from("1"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        let (_bob, mut b_rx) = SignalingClient::connect(
            &relay.factory(UserId::from("2")),
            UserId::from("2"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        alice
            .send_signal(&UserId::from("2"), SignalMessage::CallAccept {})
            .await
            .unwrap();
        let env = b_rx.recv().await.unwrap();
        assert_eq!(env.message, SignalMessage::CallAccept {});
        assert_eq!(relay.count(&UserId::from("1"), "call_accept"), 1);

        let err = alice
            .send_signal(&UserId::from("3"), SignalMessage::CallEnd {})
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_denied_device() {
        let devices = LoopbackDevices::new();
        devices.deny(Device::Camera);
        assert!(devices.camera().await.is_err());
        devices.allow(Device::Camera);
        let cam = devices.camera().await.unwrap();
        assert_eq!(cam.kind(), MediaKind::Video);
        assert_eq!(devices.issued(Device::Camera).len(), 1);
        assert!(devices.silent_audio().kind() == MediaKind::Audio);
    }
}
