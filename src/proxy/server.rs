//! Per-listener proxy server.
//!
//! # Responsibilities
//! - Bind one axum server per configured listener
//! - Propagate/derive trace context per inbound request
//! - Register tool calls found in request bodies
//! - Intercept SSE streams and buffered responses to resolve them
//! - Forward bytes unmodified otherwise
//! - Evict and report inflight calls that time out

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::{ListenerConfig, ProxyKind};
use crate::proxy::decode::{decode_body, parse_messages, SseFrameParser};
use crate::proxy::identity;
use crate::proxy::inflight::{InflightTable, InflightToolCall, Resolution, INFLIGHT_TIMEOUT, SWEEP_INTERVAL};
use crate::proxy::rpc::{classify, RpcMessage, RpcOutcome};
use crate::proxy::websocket;
use crate::telemetry::{
    ensure_trace_context, make_traceparent, next_span, now_ms, parse_traceparent, Span, SpanError,
    SpanKind, SpanStatus, TelemetryClient,
};

/// Loopback origins advertised by upstreams inside SSE frames; rewritten to
/// the client-facing host so clients that embed server-advertised callback
/// URLs keep working.
static LOOPBACK_ORIGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"http://(?:0\.0\.0\.0|localhost):\d+").unwrap());

/// Shared state injected into handlers of one listener.
#[derive(Clone)]
pub struct AppState {
    pub kind: ProxyKind,
    /// Listener name; doubles as the proxy id in span attributes.
    pub name: String,
    pub target_base: String,
    pub client: Client<HttpConnector, Body>,
    pub telemetry: Arc<TelemetryClient>,
    pub inflight: Arc<InflightTable>,
}

/// One configured proxy listener.
pub struct ProxyServer {
    router: Router,
    state: AppState,
}

impl ProxyServer {
    pub fn new(config: &ListenerConfig, name: &str, telemetry: Arc<TelemetryClient>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let state = AppState {
            kind: config.kind,
            name: name.to_owned(),
            target_base: config.target_base(),
            client,
            telemetry,
            inflight: Arc::new(InflightTable::new(name, INFLIGHT_TIMEOUT)),
        };
        let router = Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state.clone());
        Self { router, state }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve until the shutdown signal fires. The sweep task is the runtime's
    /// responsibility (see [`spawn_sweeper`]).
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            listener = %self.state.name,
            address = %addr,
            target = %self.state.target_base,
            kind = %self.state.kind,
            "proxy listener starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let name = self.state.name.clone();
        let serve = axum::serve(listener, app).into_future();

        // Dropping the serve future closes the socket and any long-lived
        // streams immediately; inflight correlation state is allowed to drop.
        tokio::select! {
            result = serve => result?,
            _ = shutdown.recv() => {}
        }

        tracing::info!(listener = %name, "proxy listener stopped");
        Ok(())
    }
}

/// Spawn the periodic eviction task for one listener's correlation table.
pub fn spawn_sweeper(
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = now_ms();
                    for call in state.inflight.sweep(now) {
                        record_timeout(&state, &call, now);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    if websocket::is_upgrade_request(request.headers()) {
        return websocket::passthrough(&state.target_base, request).await;
    }

    let start = now_ms();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_owned();
    let query = parts.uri.query().unwrap_or("").to_owned();
    let upstream_url = if query.is_empty() {
        format!("{}{}", state.target_base, path)
    } else {
        format!("{}{}?{}", state.target_base, path, query)
    };

    let incoming = parts
        .headers
        .get("traceparent")
        .and_then(|v| v.to_str().ok());
    let ctx = ensure_trace_context(parse_traceparent(incoming));
    let trace_id = ctx.trace_id.clone();
    let parent_span_id = ctx.parent_span_id.clone();
    let (_, main_span_id) = next_span(Some(&trace_id));

    let connection_key = identity::connection_key(&parts.headers, peer);
    let session_signal = identity::session_signal(&parts.headers, &query);
    let session_key = identity::session_key(&parts.headers, &query, peer);
    if session_signal.is_some() {
        state.inflight.learn_session(&connection_key, &session_key);
    }

    let is_sse_request = state.kind == ProxyKind::McpSse
        && method == Method::GET
        && (path.ends_with("/sse") || accepts_event_stream(&parts.headers));

    let request_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(listener = %state.name, error = %err, "failed to read request body");
            Bytes::new()
        }
    };
    let request_text = String::from_utf8_lossy(&request_bytes).into_owned();

    let mut registered_tool_call = false;
    for message in parse_messages(&request_text) {
        if let RpcMessage::ToolCall { id, tool_name } = classify(&message) {
            registered_tool_call = true;
            let (_, tool_span_id) = next_span(Some(&trace_id));
            let call = InflightToolCall {
                trace_id: trace_id.clone(),
                span_id: tool_span_id,
                parent_span_id: parent_span_id.clone(),
                transport: state.kind,
                session_key: session_key.clone(),
                rpc_id: id,
                tool_name,
                started_at: start,
                request_body: request_text.clone(),
                http_method: method.to_string(),
                url_path: path.clone(),
                url_query: query.clone(),
                upstream_url: upstream_url.clone(),
            };
            // teach the mapping so the streaming leg resolves to this session
            state.inflight.learn_session(&connection_key, &session_key);
            record_tool_request(&state, &call);
            state.inflight.register(call);
        }
    }

    // A tool-call carrier is represented by its request/result span pair, not
    // by a main request span.
    let record_main_span = !is_sse_request
        && !registered_tool_call
        && !(state.kind == ProxyKind::McpSse && method == Method::POST && path.contains("/message"));

    let mut outbound = Request::builder()
        .method(method.clone())
        .uri(upstream_url.as_str());
    if let Some(headers) = outbound.headers_mut() {
        for (name, value) in parts.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        let (_, child_span_id) = next_span(Some(&trace_id));
        if let Ok(value) = HeaderValue::from_str(&make_traceparent(&trace_id, &child_span_id, true)) {
            headers.insert("traceparent", value);
        }
        if let Some(signal) = &session_signal {
            if let Ok(value) = HeaderValue::from_str(signal) {
                headers.insert("mcp-session-id", value.clone());
                headers.insert("x-mcp-session-id", value);
            }
        }
    }
    let outbound = match outbound.body(Body::from(request_bytes)) {
        Ok(request) => request,
        Err(err) => {
            tracing::error!(listener = %state.name, error = %err, "failed to build upstream request");
            return bad_gateway();
        }
    };

    let upstream_response = match state.client.request(outbound).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(
                listener = %state.name,
                upstream = %upstream_url,
                error = %err,
                "upstream request failed"
            );
            if record_main_span {
                record_main(
                    &state,
                    MainSpanInput {
                        trace_id: &trace_id,
                        span_id: &main_span_id,
                        parent_span_id: parent_span_id.as_deref(),
                        method: &method,
                        path: &path,
                        query: &query,
                        upstream_url: &upstream_url,
                        request_body: &request_text,
                        response_body: "",
                        status: 502,
                        start,
                    },
                );
            }
            return bad_gateway();
        }
    };

    let (response_parts, response_body) = upstream_response.into_parts();

    let content_type = response_parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if is_sse_request {
        if content_type.contains("text/event-stream") {
            let client_host = parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            return stream_sse_response(
                state,
                response_parts,
                response_body,
                client_host,
                connection_key,
                session_key,
            );
        }
        // The upstream answered the streaming leg with some other content
        // type. Pipe it through without buffering; the body may never end.
        return Response::from_parts(response_parts, Body::new(response_body));
    }

    // Buffered transports deliver the RPC result synchronously in the HTTP
    // response; capture, decode and scan it once at completion.
    let collected = match response_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::error!(listener = %state.name, error = %err, "upstream body read failed");
            return bad_gateway();
        }
    };

    let content_encoding = response_parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let decoded = decode_body(&collected, content_encoding);
    let response_text = String::from_utf8_lossy(&decoded).into_owned();

    for message in parse_messages(&response_text) {
        handle_stream_message(&state, &connection_key, &session_key, &message);
    }

    if record_main_span {
        record_main(
            &state,
            MainSpanInput {
                trace_id: &trace_id,
                span_id: &main_span_id,
                parent_span_id: parent_span_id.as_deref(),
                method: &method,
                path: &path,
                query: &query,
                upstream_url: &upstream_url,
                request_body: &request_text,
                response_body: &response_text,
                status: response_parts.status.as_u16(),
                start,
            },
        );
    }

    Response::from_parts(response_parts, Body::from(collected))
}

/// Pipe an SSE body through the frame parser while forwarding it, feeding
/// every parsed message to the correlation step.
fn stream_sse_response(
    state: AppState,
    mut response_parts: axum::http::response::Parts,
    response_body: hyper::body::Incoming,
    client_host: Option<String>,
    connection_key: String,
    session_key: String,
) -> Response {
    let mut parser = SseFrameParser::new();
    let stream = response_body.into_data_stream().map(move |chunk| {
        chunk.map(|bytes| {
            let mut text = String::from_utf8_lossy(&bytes).into_owned();
            if let Some(host) = &client_host {
                text = rewrite_origin(&text, host);
            }
            for message in parser.push(&text) {
                handle_stream_message(&state, &connection_key, &session_key, &message);
            }
            Bytes::from(text)
        })
    });

    // origin rewriting changes the byte length
    response_parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(response_parts, Body::from_stream(stream))
}

/// Correlate one parsed message against the inflight table, emitting the
/// result span on a match.
fn handle_stream_message(
    state: &AppState,
    connection_key: &str,
    session_key: &str,
    message: &Value,
) {
    let RpcMessage::ToolResult { id, outcome } = classify(message) else {
        return;
    };

    // GET /sse carries no session signal; fall back to the mapping learned
    // from the POST leg of the same connection.
    let session_key = state
        .inflight
        .session_for_connection(connection_key)
        .unwrap_or_else(|| session_key.to_owned());

    let response_json = message.to_string();
    match state.inflight.resolve(&session_key, &id, &response_json) {
        Resolution::Matched(call) => {
            record_tool_response(state, &call, &response_json, &outcome);
        }
        Resolution::Duplicate | Resolution::NoMatch => {}
    }
}

fn rewrite_origin(text: &str, client_host: &str) -> String {
    let replacement = format!("http://{}", client_host);
    LOOPBACK_ORIGIN
        .replace_all(text, regex::NoExpand(&replacement))
        .into_owned()
}

fn accepts_event_stream(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

fn bad_gateway() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"error":"Bad Gateway"}"#,
    )
        .into_response()
}

fn tool_span_name(tool_name: Option<&str>) -> String {
    format!("mcp.tool/{}", tool_name.unwrap_or("call"))
}

/// INTERNAL request span for a registered tool call: surfaces the request
/// payload and parents the eventual result span.
fn record_tool_request(state: &AppState, call: &InflightToolCall) {
    let mut attributes = Map::new();
    attributes.insert("mcp.tool.phase".into(), json!("request"));
    attributes.insert("mcp.transport".into(), json!(call.transport.transport()));
    attributes.insert("mcp.rpc.id".into(), json!(call.rpc_id));
    attributes.insert(
        "mcp.tool.name".into(),
        json!(call.tool_name.as_deref().unwrap_or("")),
    );
    attributes.insert("mcp.session_id".into(), json!(call.session_key));
    attributes.insert("mcp.proxy_id".into(), json!(state.name));
    attributes.insert("http.request.body".into(), json!(call.request_body));
    attributes.insert("url.path".into(), json!(call.url_path));
    attributes.insert("url.query".into(), json!(call.url_query));

    state.telemetry.record(Span {
        trace_id: call.trace_id.clone(),
        span_id: call.span_id.clone(),
        parent_span_id: call.parent_span_id.clone(),
        name: format!(
            "mcp.tool_request/{}",
            call.tool_name.as_deref().unwrap_or("call")
        ),
        kind: SpanKind::Internal,
        start_time_ms: call.started_at,
        end_time_ms: call.started_at + 1,
        status: SpanStatus::Ok,
        attributes,
        error: None,
    });
}

/// SERVER span for a matched tool result, parented to the request span.
fn record_tool_response(
    state: &AppState,
    call: &InflightToolCall,
    response_json: &str,
    outcome: &RpcOutcome,
) {
    let now = now_ms();
    let duration = now.saturating_sub(call.started_at);
    let (_, response_span_id) = next_span(Some(&call.trace_id));

    tracing::info!(
        listener = %state.name,
        rpc_id = %call.rpc_id,
        tool = call.tool_name.as_deref().unwrap_or("call"),
        duration_ms = duration,
        session = %call.session_key,
        "recorded tool response"
    );

    let mut attributes = Map::new();
    attributes.insert("mcp.transport".into(), json!(call.transport.transport()));
    attributes.insert("mcp.rpc.id".into(), json!(call.rpc_id));
    attributes.insert(
        "mcp.tool.name".into(),
        json!(call.tool_name.as_deref().unwrap_or("")),
    );
    attributes.insert("mcp.session_id".into(), json!(call.session_key));
    attributes.insert("mcp.proxy_id".into(), json!(state.name));
    attributes.insert("http.request.body".into(), json!(call.request_body));
    attributes.insert("http.response.body".into(), json!(response_json));
    attributes.insert("http.response.status_code".into(), json!(200));
    attributes.insert("http.response.size".into(), json!(response_json.len()));
    attributes.insert("url.path".into(), json!(call.url_path));
    attributes.insert("url.query".into(), json!(call.url_query));
    attributes.insert("upstream.url".into(), json!(call.upstream_url));
    attributes.insert("mcp.response.duration_ms".into(), json!(duration));

    let (status, error) = match outcome {
        RpcOutcome::Ok => (SpanStatus::Ok, None),
        RpcOutcome::Err { message } => (
            SpanStatus::Error,
            Some(SpanError {
                message: message.clone(),
                error_type: None,
            }),
        ),
    };

    state.telemetry.record(Span {
        trace_id: call.trace_id.clone(),
        span_id: response_span_id,
        parent_span_id: Some(call.span_id.clone()),
        name: tool_span_name(call.tool_name.as_deref()),
        kind: SpanKind::Server,
        start_time_ms: call.started_at,
        end_time_ms: now,
        status,
        attributes,
        error,
    });

    let telemetry = Arc::clone(&state.telemetry);
    tokio::spawn(async move { telemetry.flush().await });
}

/// ERROR span for an inflight call evicted by the timeout sweep. Reuses the
/// request span id; the only proxy-initiated synthetic span.
fn record_timeout(state: &AppState, call: &InflightToolCall, now: u64) {
    let mut attributes = Map::new();
    attributes.insert("mcp.timeout".into(), json!(true));
    attributes.insert("mcp.transport".into(), json!(call.transport.transport()));
    attributes.insert("mcp.rpc.id".into(), json!(call.rpc_id));
    attributes.insert("mcp.session_id".into(), json!(call.session_key));
    attributes.insert("mcp.proxy_id".into(), json!(state.name));

    state.telemetry.record(Span {
        trace_id: call.trace_id.clone(),
        span_id: call.span_id.clone(),
        parent_span_id: call.parent_span_id.clone(),
        name: tool_span_name(call.tool_name.as_deref()),
        kind: SpanKind::Server,
        start_time_ms: call.started_at,
        end_time_ms: now,
        status: SpanStatus::Error,
        attributes,
        error: Some(SpanError {
            message: format!(
                "timeout waiting for {} response",
                call.transport.transport()
            ),
            error_type: None,
        }),
    });
}

struct MainSpanInput<'a> {
    trace_id: &'a str,
    span_id: &'a str,
    parent_span_id: Option<&'a str>,
    method: &'a Method,
    path: &'a str,
    query: &'a str,
    upstream_url: &'a str,
    request_body: &'a str,
    response_body: &'a str,
    status: u16,
    start: u64,
}

/// SERVER span for a plain (non-tool-carrier) proxied request.
fn record_main(state: &AppState, input: MainSpanInput<'_>) {
    let mut attributes = Map::new();
    attributes.insert("mcp.transport".into(), json!(state.kind.transport()));
    attributes.insert("http.method".into(), json!(input.method.as_str()));
    attributes.insert("url.path".into(), json!(input.path));
    attributes.insert("url.query".into(), json!(input.query));
    attributes.insert("upstream.url".into(), json!(input.upstream_url));
    attributes.insert("http.request.body".into(), json!(input.request_body));
    attributes.insert("http.response.body".into(), json!(input.response_body));
    attributes.insert("http.response.status_code".into(), json!(input.status));

    state.telemetry.record(Span {
        trace_id: input.trace_id.to_owned(),
        span_id: input.span_id.to_owned(),
        parent_span_id: input.parent_span_id.map(str::to_owned),
        name: format!("mcp.{}/{}", state.kind, state.name),
        kind: SpanKind::Server,
        start_time_ms: input.start,
        end_time_ms: now_ms(),
        status: if input.status < 500 {
            SpanStatus::Ok
        } else {
            SpanStatus::Error
        },
        attributes,
        error: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_origin() {
        let text = "data: {\"endpoint\":\"http://0.0.0.0:8931/messages?sessionId=1\"}\n\n";
        let rewritten = rewrite_origin(text, "127.0.0.1:18931");
        assert!(rewritten.contains("http://127.0.0.1:18931/messages?sessionId=1"));
        assert!(!rewritten.contains("0.0.0.0"));

        let localhost = rewrite_origin("http://localhost:3000/sse", "proxy.example");
        assert_eq!(localhost, "http://proxy.example/sse");

        // other origins untouched
        let other = "http://upstream.internal:3000/sse";
        assert_eq!(rewrite_origin(other, "x"), other);
    }

    #[test]
    fn test_tool_span_name() {
        assert_eq!(tool_span_name(Some("search")), "mcp.tool/search");
        assert_eq!(tool_span_name(None), "mcp.tool/call");
    }
}
