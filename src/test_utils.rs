use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use callcore::crypto::IdentityKeyPair;
use callcore::net::{HttpClient, HttpRequest, HttpResponse};
use callcore::signaling::SignalMessage;
use callcore::types::call::UserId;

use crate::calls::CallContext;
use crate::config::CallConfig;
use crate::keys::{KeyExchange, StaticKeyDirectory};
use crate::loopback::{LoopbackDevices, LoopbackPeerConnectionFactory, RecordingHandler};
use crate::signaling::{SignalSender, SignalingError};

/// Answers every request with the same response and records the requests.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    response: Option<HttpResponse>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn with_response(response: HttpResponse) -> Self {
        Self {
            response: Some(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        self.requests.lock().unwrap().push(request);
        Ok(self.response.clone().unwrap_or(HttpResponse {
            status_code: 200,
            body: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailingMockHttpClient;

#[async_trait]
impl HttpClient for FailingMockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        Err(anyhow::anyhow!("Not implemented"))
    }
}

/// Acks every message immediately and keeps a log of them.
#[derive(Default)]
pub struct RecordingSignalSender {
    sent: Mutex<Vec<(UserId, SignalMessage)>>,
    failing: Mutex<HashSet<&'static str>>,
    unacked: Mutex<HashSet<&'static str>>,
}

impl RecordingSignalSender {
    pub fn messages(&self) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    /// Make every later message of `kind` time out.
    pub fn fail(&self, kind: &'static str) {
        self.failing.lock().unwrap().insert(kind);
    }

    /// Record later messages of `kind` as delivered but report a timeout,
    /// as when the relay forwards a request and its ack is lost.
    pub fn lose_acks(&self, kind: &'static str) {
        self.unacked.lock().unwrap().insert(kind);
    }

    /// Undo every `fail` and `lose_acks`.
    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.unacked.lock().unwrap().clear();
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl SignalSender for RecordingSignalSender {
    async fn send_signal(
        &self,
        to: &UserId,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        if self.failing.lock().unwrap().contains(message.kind()) {
            return Err(SignalingError::Timeout(std::time::Duration::from_secs(10)));
        }
        let unacked = self.unacked.lock().unwrap().contains(message.kind());
        self.sent.lock().unwrap().push((to.clone(), message));
        if unacked {
            return Err(SignalingError::Timeout(std::time::Duration::from_secs(10)));
        }
        Ok(())
    }
}

/// One side of a call with every collaborator exposed for inspection.
pub struct TestPeer {
    pub user: UserId,
    pub ctx: Arc<CallContext>,
    pub signals: Arc<RecordingSignalSender>,
    pub pcs: Arc<LoopbackPeerConnectionFactory>,
    pub devices: Arc<LoopbackDevices>,
    pub events: Arc<RecordingHandler>,
}

/// Users "1" and "2" sharing a public-key directory.
pub fn create_test_pair() -> (TestPeer, TestPeer) {
    create_test_pair_with_config(CallConfig::default())
}

pub fn create_test_pair_with_config(config: CallConfig) -> (TestPeer, TestPeer) {
    let directory = Arc::new(StaticKeyDirectory::new());
    let make = |id: &str, name: &str| {
        let user = UserId::from(id);
        let identity = IdentityKeyPair::generate();
        directory.insert(user.clone(), identity.public_key());
        let signals = Arc::new(RecordingSignalSender::default());
        let pcs = LoopbackPeerConnectionFactory::new();
        let devices = LoopbackDevices::new();
        let events = RecordingHandler::new();
        let ctx = CallContext::new(
            user.clone(),
            name,
            signals.clone(),
            Arc::new(KeyExchange::new(identity, directory.clone())),
            devices.clone(),
            pcs.clone(),
        )
        .with_config(config.clone())
        .with_event_handler(events.clone());
        TestPeer {
            user,
            ctx: Arc::new(ctx),
            signals,
            pcs,
            devices,
            events,
        }
    };
    (make("1", "alice"), make("2", "bob"))
}
