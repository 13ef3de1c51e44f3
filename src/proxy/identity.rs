//! Session and connection identity derivation.
//!
//! One logical MCP session arrives on two physical legs: a POST channel that
//! carries an explicit session id, and a GET/streaming channel that carries
//! none. Both must resolve to the same session key. The layered fallbacks
//! here, plus the learned connection→session map in the correlation table,
//! bridge that gap for the streaming leg.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::net::SocketAddr;

/// Opaque, injective encoding of a raw identity string.
///
/// Distinct inputs never produce the same key within this scheme.
pub fn stable_key(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Connection identity: first forwarded-for entry (else the socket peer
/// address) plus the host header. Last-resort session fallback and the key
/// for the learned connection→session map.
pub fn connection_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.ip().to_string());
    let host = header_str(headers, "host").unwrap_or("");
    stable_key(&format!("{}|{}", forwarded, host))
}

/// The explicit session signal carried by a request, if any: session header,
/// query-string parameter, or session cookie, in that priority order.
pub fn session_signal(headers: &HeaderMap, query: &str) -> Option<String> {
    if let Some(sid) = header_str(headers, "mcp-session-id")
        .or_else(|| header_str(headers, "x-mcp-session-id"))
    {
        return Some(sid.to_owned());
    }

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "sessionId" || key == "session_id" {
            return Some(value.into_owned());
        }
    }

    let cookies = header_str(headers, "cookie")?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some((name, value)) = pair.split_once('=') {
            if name == "mcp_session" || name == "session" {
                return Some(value.to_owned());
            }
        }
    }
    None
}

/// Session identity: the explicit signal if present, else the connection key.
pub fn session_key(headers: &HeaderMap, query: &str, peer: SocketAddr) -> String {
    match session_signal(headers, query) {
        Some(sid) => stable_key(&sid),
        None => stable_key(&connection_key(headers, peer)),
    }
}
