//! ICE server configuration.

use serde::{Deserialize, Serialize};

/// Used when the ICE-server endpoint is unreachable or returns garbage.
pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceServersBody {
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
    Bare(Vec<IceServer>),
}

/// Parse the REST response body. Accepts either `{"iceServers": [...]}` or a
/// bare array. An empty list is an error so callers fall back to STUN.
pub fn parse_ice_servers(body: &[u8]) -> Result<Vec<IceServer>, serde_json::Error> {
    let servers = match serde_json::from_slice::<IceServersBody>(body)? {
        IceServersBody::Wrapped { ice_servers } => ice_servers,
        IceServersBody::Bare(list) => list,
    };
    if servers.is_empty() || servers.iter().any(|s| s.urls.is_empty()) {
        return Err(serde::de::Error::custom("no usable ICE servers"));
    }
    Ok(servers)
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(u) => vec![u],
        Urls::Many(v) => v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_wrapped_response() {
        let body = br#"{"iceServers":[
            {"urls":"stun:stun.example.org:3478"},
            {"urls":["turn:turn.example.org:3478?transport=udp","turns:turn.example.org:5349"],
             "username":"u","credential":"p"}
        ]}"#;
        let servers = parse_ice_servers(body).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert!(!servers[0].is_turn());
        assert!(servers[1].is_turn());
        assert_eq!(servers[1].credential.as_deref(), Some("p"));
    }

    #[test]
    fn test_parses_bare_array() {
        let servers = parse_ice_servers(br#"[{"urls":"stun:a:1"}]"#).unwrap();
        assert_eq!(servers, vec![IceServer::stun("stun:a:1")]);
    }

    #[test]
    fn test_rejects_empty_or_malformed() {
        assert!(parse_ice_servers(br#"{"iceServers":[]}"#).is_err());
        assert!(parse_ice_servers(br#"[{"urls":[]}]"#).is_err());
        assert!(parse_ice_servers(b"<html>").is_err());
    }
}
