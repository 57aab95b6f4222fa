//! ICE server discovery.

use callcore::ice::{IceServer, parse_ice_servers};
use callcore::net::{HttpClient, HttpRequest};
use log::{debug, warn};

/// Fetch the ICE server list, falling back to a single STUN server when the
/// endpoint is unset, unreachable or returns something unusable.
pub async fn fetch_ice_servers(
    http: Option<&dyn HttpClient>,
    url: Option<&str>,
    fallback_stun_url: &str,
) -> Vec<IceServer> {
    let fallback = || vec![IceServer::stun(fallback_stun_url)];

    let (Some(http), Some(url)) = (http, url) else {
        debug!("No ICE server endpoint configured, using {fallback_stun_url}");
        return fallback();
    };

    let response = match http
        .execute(HttpRequest::get(url).with_header("Accept", "application/json"))
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!("ICE server fetch failed: {e}");
            return fallback();
        }
    };

    if !response.is_success() {
        warn!("ICE server fetch returned HTTP {}", response.status_code);
        return fallback();
    }

    match parse_ice_servers(&response.body) {
        Ok(servers) => {
            debug!("Fetched {} ICE servers", servers.len());
            servers
        }
        Err(e) => {
            warn!("Unusable ICE server response: {e}");
            fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingMockHttpClient, MockHttpClient};
    use callcore::ice::FALLBACK_STUN_URL;
    use callcore::net::HttpResponse;

    #[tokio::test]
    async fn test_uses_fetched_servers() {
        let http = MockHttpClient::with_response(HttpResponse {
            status_code: 200,
            body: br#"{"iceServers":[{"urls":"turn:t.example:3478","username":"u","credential":"c"}]}"#
                .to_vec(),
        });
        let servers =
            fetch_ice_servers(Some(&http), Some("https://x/ice"), FALLBACK_STUN_URL).await;
        assert_eq!(servers.len(), 1);
        assert!(servers[0].is_turn());
        assert_eq!(http.requests()[0].url, "https://x/ice");
    }

    #[tokio::test]
    async fn test_falls_back_on_transport_error() {
        let http = FailingMockHttpClient;
        let servers =
            fetch_ice_servers(Some(&http), Some("https://x/ice"), FALLBACK_STUN_URL).await;
        assert_eq!(servers, vec![IceServer::stun(FALLBACK_STUN_URL)]);
    }

    #[tokio::test]
    async fn test_falls_back_on_http_error_and_garbage() {
        let http = MockHttpClient::with_response(HttpResponse::empty(502));
        let servers =
            fetch_ice_servers(Some(&http), Some("https://x/ice"), FALLBACK_STUN_URL).await;
        assert_eq!(servers[0].urls[0], FALLBACK_STUN_URL);

        let http = MockHttpClient::with_response(HttpResponse {
            status_code: 200,
            body: b"[]".to_vec(),
        });
        let servers =
            fetch_ice_servers(Some(&http), Some("https://x/ice"), FALLBACK_STUN_URL).await;
        assert_eq!(servers[0].urls[0], FALLBACK_STUN_URL);
    }

    #[tokio::test]
    async fn test_no_endpoint_uses_fallback() {
        let servers = fetch_ice_servers(None, None, "stun:other:1").await;
        assert_eq!(servers, vec![IceServer::stun("stun:other:1")]);
    }
}
