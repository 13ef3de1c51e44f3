//! Inflight tool-call correlation table.
//!
//! Maps `"{sessionKey}:{rpcId}"` to a registered tool call awaiting its
//! asynchronous result. One logical call moves `REGISTERED → RESOLVED` on a
//! matching terminal response, or `REGISTERED → TIMED_OUT` via the periodic
//! sweep; each registered call produces exactly one terminal span, never two.
//!
//! All state sits behind a single mutex because resolution must observe the
//! inflight entry, its dedup markers and the completed set atomically. No
//! lock is held across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::ProxyKind;

pub const INFLIGHT_TIMEOUT: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A registered tool call awaiting its result.
#[derive(Debug, Clone)]
pub struct InflightToolCall {
    pub trace_id: String,
    /// Request-span id; becomes the parent of the result span.
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub transport: ProxyKind,
    pub session_key: String,
    pub rpc_id: String,
    pub tool_name: Option<String>,
    pub started_at: u64,
    pub request_body: String,
    pub http_method: String,
    pub url_path: String,
    pub url_query: String,
    pub upstream_url: String,
}

impl InflightToolCall {
    pub fn key(&self) -> String {
        format!("{}:{}", self.session_key, self.rpc_id)
    }
}

/// Outcome of feeding one terminal response into the table.
#[derive(Debug)]
pub enum Resolution {
    /// The call matched and has been removed; the caller emits its span.
    Matched(InflightToolCall),
    /// A duplicate of an already-recorded response; ignore silently.
    Duplicate,
    /// Nothing inflight matched this response.
    NoMatch,
}

#[derive(Default)]
struct TableState {
    inflight: HashMap<String, InflightToolCall>,
    /// Last recorded response JSON per key; suppresses byte-identical
    /// retransmissions (e.g. repeated SSE frames).
    last_responses: HashMap<String, String>,
    /// Keys whose result has been recorded; later arrivals are ignored even
    /// if the JSON differs slightly due to re-serialization.
    completed: HashSet<String>,
    /// connectionKey → sessionKey, learned from requests carrying an explicit
    /// session signal; resolves identity for responses on connections that
    /// carry none (SSE pulls).
    connection_sessions: HashMap<String, String>,
}

pub struct InflightTable {
    listener: String,
    timeout: Duration,
    state: Mutex<TableState>,
}

impl InflightTable {
    pub fn new(listener: impl Into<String>, timeout: Duration) -> Self {
        Self {
            listener: listener.into(),
            timeout,
            state: Mutex::new(TableState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a tool call. A new call under an existing key supersedes the
    /// previous one and invalidates its dedup markers.
    pub fn register(&self, call: InflightToolCall) {
        let key = call.key();
        let mut state = self.lock();
        state.last_responses.remove(&key);
        state.completed.remove(&key);
        state.inflight.insert(key, call);
    }

    /// Learn the connection→session mapping from a request that carried an
    /// explicit session identifier.
    pub fn learn_session(&self, connection_key: &str, session_key: &str) {
        self.lock()
            .connection_sessions
            .insert(connection_key.to_owned(), session_key.to_owned());
    }

    pub fn session_for_connection(&self, connection_key: &str) -> Option<String> {
        self.lock().connection_sessions.get(connection_key).cloned()
    }

    /// Feed a terminal response into the table.
    ///
    /// Lookup is exact by `sessionKey:rpcId`, then falls back to a unique
    /// `:rpcId` suffix match. The fallback can mis-attribute when two
    /// sessions use the same rpc id concurrently; it is a deliberate
    /// best-effort heuristic covering streams that carry no session signal.
    pub fn resolve(&self, session_key: &str, rpc_id: &str, response_json: &str) -> Resolution {
        let mut state = self.lock();
        let mut key = format!("{}:{}", session_key, rpc_id);

        if state.completed.contains(&key) {
            return Resolution::Duplicate;
        }

        if !state.inflight.contains_key(&key) {
            let suffix = format!(":{}", rpc_id);
            let mut matches = state.inflight.keys().filter(|k| k.ends_with(&suffix));
            match (matches.next().cloned(), matches.next()) {
                (Some(only), None) => key = only,
                _ => {
                    if !state.inflight.is_empty() {
                        tracing::debug!(
                            listener = %self.listener,
                            key = %key,
                            inflight = state.inflight.len(),
                            "no inflight call for response"
                        );
                    }
                    return Resolution::NoMatch;
                }
            }
            if state.completed.contains(&key) {
                return Resolution::Duplicate;
            }
        }

        if state.last_responses.get(&key).map(String::as_str) == Some(response_json) {
            state.inflight.remove(&key);
            return Resolution::Duplicate;
        }

        let Some(call) = state.inflight.remove(&key) else {
            return Resolution::NoMatch;
        };
        state.last_responses.insert(key.clone(), response_json.to_owned());
        state.completed.insert(key);
        Resolution::Matched(call)
    }

    /// Evict every entry older than the timeout, removing its auxiliary
    /// markers so a late-arriving duplicate cannot resurrect it. Returns the
    /// evicted calls for timeout span emission.
    pub fn sweep(&self, now_ms: u64) -> Vec<InflightToolCall> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut state = self.lock();
        let expired: Vec<String> = state
            .inflight
            .iter()
            .filter(|(_, call)| now_ms.saturating_sub(call.started_at) > timeout_ms)
            .map(|(key, _)| key.clone())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for key in expired {
            tracing::warn!(listener = %self.listener, key = %key, "inflight tool call timed out");
            state.last_responses.remove(&key);
            state.completed.remove(&key);
            if let Some(call) = state.inflight.remove(&key) {
                evicted.push(call);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
