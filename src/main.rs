use chrono::Local;
use clap::Parser;
use e2ecall::calls::media::RtpSender;
use e2ecall::calls::{CallContext, CallEvent, CallEventHandler, CallManager, SignalingRouter};
use e2ecall::callcore::crypto::IdentityKeyPair;
use e2ecall::callcore::types::call::{MediaKind, UserId};
use e2ecall::http::UreqHttpClient;
use e2ecall::keys::{KeyExchange, StaticKeyDirectory};
use e2ecall::loopback::{
    LoopbackDevices, LoopbackPeerConnectionFactory, LoopbackRelay, RecordingHandler,
};
use e2ecall::transport::{TransportFactory, WebSocketTransportFactory};
use e2ecall::{CallConfig, SignalingClient};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Demo of the call engine.
//
// Usage:
//   cargo run                                        # two peers in one process
//   cargo run -- --relay ws://localhost:8080/ws --user 1 --peer 2 \
//       --secret <hex> --peer-key <hex> [--call]     # one peer against a real relay

#[derive(Parser, Debug)]
#[command(name = "e2ecall-demo", about = "Encrypted call engine demo")]
struct Args {
    /// Signaling relay WebSocket URL. Without it both peers run in-process.
    #[arg(long)]
    relay: Option<String>,

    #[arg(long, default_value = "1")]
    user: String,

    #[arg(long, default_value = "2")]
    peer: String,

    /// Our X25519 secret key, hex. Random when omitted.
    #[arg(long)]
    secret: Option<String>,

    /// The peer's X25519 public key, hex.
    #[arg(long)]
    peer_key: Option<String>,

    /// Call the peer instead of waiting to be called.
    #[arg(long)]
    call: bool,

    /// REST endpoint returning the ICE server list.
    #[arg(long)]
    ice_url: Option<String>,

    /// Seconds to keep the call up.
    #[arg(long, default_value_t = 5)]
    duration: u64,
}

/// Accepts every incoming call.
struct AutoAnswer(mpsc::UnboundedSender<UserId>);

impl CallEventHandler for AutoAnswer {
    fn handle_event(&self, event: &CallEvent) {
        match event {
            CallEvent::IncomingCall { peer, username } => {
                info!("Incoming call from {username} ({peer}), answering");
                let _ = self.0.send(peer.clone());
            }
            CallEvent::KeyFingerprint { peer, fingerprint } => {
                info!("Key with {peer}: {fingerprint}");
            }
            CallEvent::CallEnded { peer, reason } => info!("Call with {peer} ended: {reason}"),
            _ => {}
        }
    }
}

fn spawn_auto_answer(manager: Arc<CallManager>, mut incoming: mpsc::UnboundedReceiver<UserId>) {
    tokio::spawn(async move {
        while let Some(peer) = incoming.recv().await {
            if let Err(e) = manager.accept_call(&peer).await {
                warn!("Failed to accept call from {peer}: {e}");
            }
        }
    });
}

fn config(args: &Args) -> CallConfig {
    match &args.ice_url {
        Some(url) => CallConfig::default().with_ice_servers_url(url),
        None => CallConfig::default(),
    }
}

fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(s).map_err(|e| anyhow::anyhow!("invalid hex: {e}"))
}

fn parse_secret(hex_secret: Option<&str>) -> anyhow::Result<IdentityKeyPair> {
    let Some(s) = hex_secret else {
        return Ok(IdentityKeyPair::generate());
    };
    let bytes: [u8; 32] = decode_hex(s)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 32 bytes"))?;
    Ok(IdentityKeyPair::from_secret_bytes(bytes))
}

struct Peer {
    manager: Arc<CallManager>,
    pcs: Arc<LoopbackPeerConnectionFactory>,
    events: Arc<RecordingHandler>,
}

async fn start_peer(
    user: UserId,
    username: &str,
    identity: IdentityKeyPair,
    directory: Arc<StaticKeyDirectory>,
    transport: &dyn TransportFactory,
    config: CallConfig,
) -> anyhow::Result<Peer> {
    let (signaling, inbound) =
        SignalingClient::connect(transport, user.clone(), config.signaling_timeout).await?;
    let pcs = LoopbackPeerConnectionFactory::new();
    let events = RecordingHandler::new();
    let (answer_tx, answer_rx) = mpsc::unbounded_channel();

    let ctx = CallContext::new(
        user,
        username,
        signaling,
        Arc::new(KeyExchange::new(identity, directory)),
        LoopbackDevices::new(),
        pcs.clone(),
    )
    .with_http_client(Arc::new(UreqHttpClient::new()))
    .with_config(config)
    .with_event_handler(events.clone())
    .with_event_handler(Arc::new(AutoAnswer(answer_tx)));

    let manager = CallManager::new(Arc::new(ctx));
    SignalingRouter::new(manager.clone()).spawn(inbound);
    spawn_auto_answer(manager.clone(), answer_rx);
    Ok(Peer {
        manager,
        pcs,
        events,
    })
}

async fn run_in_process(args: &Args) -> anyhow::Result<()> {
    let relay = LoopbackRelay::new();
    let directory = Arc::new(StaticKeyDirectory::new());
    let (alice_id, bob_id) = (UserId::from(args.user.as_str()), UserId::from(args.peer.as_str()));
    let (alice_key, bob_key) = (IdentityKeyPair::generate(), IdentityKeyPair::generate());
    directory.insert(alice_id.clone(), alice_key.public_key());
    directory.insert(bob_id.clone(), bob_key.public_key());

    let alice = start_peer(
        alice_id.clone(),
        "alice",
        alice_key,
        directory.clone(),
        &relay.factory(alice_id.clone()),
        config(args),
    )
    .await?;
    let bob = start_peer(
        bob_id.clone(),
        "bob",
        bob_key,
        directory,
        &relay.factory(bob_id.clone()),
        config(args),
    )
    .await?;

    alice.manager.start_call(bob_id.clone()).await?;
    let is_active = |e: &CallEvent| matches!(e, CallEvent::CallActive { .. });
    if alice.events.wait_for(is_active, Duration::from_secs(10)).await.is_none() {
        anyhow::bail!("call did not become active");
    }
    info!("Call is active");

    alice.manager.toggle_video(&bob_id).await?;
    let is_video = |e: &CallEvent| matches!(e, CallEvent::RemoteVideo { .. });
    if bob.events.wait_for(is_video, Duration::from_secs(10)).await.is_some() {
        let (Some(alice_pc), Some(bob_pc)) = (alice.pcs.last(), bob.pcs.last()) else {
            anyhow::bail!("peer connections missing");
        };
        for sender in alice_pc
            .loopback_senders()
            .into_iter()
            .filter(|s| s.kind() == MediaKind::Video)
        {
            let id = sender.id().to_string();
            let wire = sender.push_frame(b"hello from alice")?;
            info!("Video frame on the wire: {}", hex::encode(&wire));
            if let Some(receiver) = bob_pc.receiver_for(&id) {
                let plain = receiver.receive_frame(&wire)?;
                info!("Bob decrypted: {}", String::from_utf8_lossy(&plain));
            }
        }
    }

    tokio::time::sleep(Duration::from_secs(args.duration)).await;
    alice.manager.end_call(&bob_id).await?;
    bob.manager.shutdown().await;
    Ok(())
}

async fn run_with_relay(args: &Args, url: &str) -> anyhow::Result<()> {
    let identity = parse_secret(args.secret.as_deref())?;
    info!(
        "Our public key: {}",
        hex::encode(identity.public_key().as_bytes())
    );
    let user = UserId::from(args.user.as_str());
    let peer = UserId::from(args.peer.as_str());

    let directory = Arc::new(StaticKeyDirectory::new());
    match &args.peer_key {
        Some(key) => directory.insert_bytes(peer.clone(), &decode_hex(key)?)?,
        None => warn!("No --peer-key given, key exchange with {peer} will fail"),
    }

    let local = start_peer(
        user,
        &args.user,
        identity,
        directory,
        &WebSocketTransportFactory::new(url),
        config(args),
    )
    .await?;

    if args.call {
        local.manager.start_call(peer.clone()).await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
    }
    local.manager.shutdown().await;
    Ok(())
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let result = match &args.relay {
            Some(url) => run_with_relay(&args, url).await,
            None => run_in_process(&args).await,
        };
        if let Err(e) = result {
            error!("Demo failed: {e}");
        }
    });
}
