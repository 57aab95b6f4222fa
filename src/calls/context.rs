//! Collaborators shared by every call session of one client.

use super::events::{CallEventBus, CallEventHandler};
use super::media::{MediaDevices, PeerConnectionFactory};
use crate::config::CallConfig;
use crate::ice::fetch_ice_servers;
use crate::keys::KeyExchange;
use crate::signaling::SignalSender;
use callcore::ice::IceServer;
use callcore::net::HttpClient;
use callcore::types::call::UserId;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct CallContext {
    pub(crate) local_user: UserId,
    pub(crate) local_username: String,
    pub(crate) signaling: Arc<dyn SignalSender>,
    pub(crate) key_exchange: Arc<KeyExchange>,
    pub(crate) devices: Arc<dyn MediaDevices>,
    pub(crate) pc_factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) http: Option<Arc<dyn HttpClient>>,
    pub(crate) events: CallEventBus,
    pub(crate) config: CallConfig,
    ice_servers: OnceCell<Vec<IceServer>>,
}

impl CallContext {
    pub fn new(
        local_user: UserId,
        local_username: impl Into<String>,
        signaling: Arc<dyn SignalSender>,
        key_exchange: Arc<KeyExchange>,
        devices: Arc<dyn MediaDevices>,
        pc_factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        Self {
            local_user,
            local_username: local_username.into(),
            signaling,
            key_exchange,
            devices,
            pc_factory,
            http: None,
            events: CallEventBus::new(),
            config: CallConfig::default(),
            ice_servers: OnceCell::new(),
        }
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_event_handler(self, handler: Arc<dyn CallEventHandler>) -> Self {
        self.events.add_handler(handler);
        self
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn events(&self) -> &CallEventBus {
        &self.events
    }

    /// ICE servers for new peer connections, fetched once per process.
    pub async fn ice_servers(&self) -> &[IceServer] {
        self.ice_servers
            .get_or_init(|| {
                fetch_ice_servers(
                    self.http.as_deref(),
                    self.config.ice_servers_url.as_deref(),
                    &self.config.fallback_stun_url,
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, create_test_pair};
    use callcore::net::HttpResponse;

    #[tokio::test]
    async fn test_ice_servers_fetched_once() {
        let (peer, _) = create_test_pair();
        let http = Arc::new(MockHttpClient::with_response(HttpResponse {
            status_code: 200,
            body: br#"[{"urls":["stun:a:3478","stun:b:3478"]}]"#.to_vec(),
        }));
        let ctx = CallContext::new(
            peer.user.clone(),
            "alice",
            peer.signals.clone(),
            peer.ctx.key_exchange.clone(),
            peer.devices.clone(),
            peer.pcs.clone(),
        )
        .with_http_client(http.clone())
        .with_config(CallConfig::default().with_ice_servers_url("https://relay/ice"));

        assert_eq!(ctx.ice_servers().await[0].urls.len(), 2);
        assert_eq!(ctx.ice_servers().await.len(), 1);
        assert_eq!(http.requests().len(), 1);
    }
}
