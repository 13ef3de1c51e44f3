//! Configuration schema definitions.
//!
//! The proxy is configured as a JSON object mapping listener names to
//! listener entries. All types derive Serde traits for deserialization.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full proxy configuration: listener name → listener entry.
pub type ProxyConfig = BTreeMap<String, ListenerConfig>;

/// Transport flavor handled by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    McpHttp,
    McpSse,
    Openapi,
}

impl ProxyKind {
    /// Transport label used in span attributes and timeout messages.
    pub fn transport(&self) -> &'static str {
        match self {
            ProxyKind::McpSse => "sse",
            ProxyKind::McpHttp | ProxyKind::Openapi => "http",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyKind::McpHttp => "mcp_http",
            ProxyKind::McpSse => "mcp_sse",
            ProxyKind::Openapi => "openapi",
        };
        f.write_str(s)
    }
}

/// One listener entry.
///
/// Note the direction of the fields: the proxy binds `target_host:target_port`
/// and forwards to the upstream at `host:port`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    #[serde(rename = "type")]
    pub kind: ProxyKind,

    /// Upstream host to forward to.
    pub host: String,

    /// Upstream port. Accepted as string or number.
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub port: u16,

    /// Local bind host; defaults to `0.0.0.0`.
    pub target_host: Option<String>,

    /// Local bind port. Accepted as string or number.
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub target_port: u16,

    /// Listener display name; defaults to the mapping key.
    pub name: Option<String>,
}

impl ListenerConfig {
    pub fn bind_host(&self) -> &str {
        self.target_host.as_deref().unwrap_or("0.0.0.0")
    }

    /// Base URL of the upstream this listener forwards to.
    pub fn target_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn port_from_string_or_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Number(u64),
        String(String),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Number(n) => {
            u16::try_from(n).map_err(|_| de::Error::custom(format!("port out of range: {}", n)))
        }
        StringOrNumber::String(s) => s
            .parse::<u16>()
            .map_err(|_| de::Error::custom(format!("invalid port: {:?}", s))),
    }
}
