use callcore::ice::FALLBACK_STUN_URL;
use std::time::Duration;

/// Tunables for the call engine.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Round-trip limit for every signaling request.
    pub signaling_timeout: Duration,
    /// How often the key distributor replaces the session key.
    pub key_rotation_interval: Duration,
    /// Pause between sending a media toggle and adding the track, so the peer
    /// sees the toggle before the track event.
    pub toggle_signal_delay: Duration,
    /// Upper bound on one offer/answer exchange before the negotiation guard
    /// is forcibly released.
    pub negotiation_timeout: Duration,
    /// REST endpoint returning the ICE server list. `None` uses the fallback.
    pub ice_servers_url: Option<String>,
    pub fallback_stun_url: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_timeout: Duration::from_millis(10_000),
            key_rotation_interval: Duration::from_secs(600),
            toggle_signal_delay: Duration::from_millis(100),
            negotiation_timeout: Duration::from_secs(15),
            ice_servers_url: None,
            fallback_stun_url: FALLBACK_STUN_URL.to_string(),
        }
    }
}

impl CallConfig {
    pub fn with_ice_servers_url(mut self, url: impl Into<String>) -> Self {
        self.ice_servers_url = Some(url.into());
        self
    }

    pub fn with_key_rotation_interval(mut self, interval: Duration) -> Self {
        self.key_rotation_interval = interval;
        self
    }

    pub fn with_signaling_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.signaling_timeout, Duration::from_secs(10));
        assert_eq!(config.key_rotation_interval, Duration::from_secs(600));
        assert_eq!(config.toggle_signal_delay, Duration::from_millis(100));
        assert!(config.ice_servers_url.is_none());
        assert_eq!(config.fallback_stun_url, "stun:stun.l.google.com:19302");
    }
}
