//! Shared utilities for integration testing: a span ingest sink and mock MCP
//! upstreams speaking the SSE and buffered-HTTP transports.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Collected span events, flattened out of their ingest payloads.
pub type CollectedSpans = Arc<Mutex<Vec<Value>>>;

/// Start an ingest sink that records every span event POSTed to `/ingest`.
pub async fn start_ingest_sink(addr: SocketAddr) -> CollectedSpans {
    let spans: CollectedSpans = Arc::new(Mutex::new(Vec::new()));

    async fn ingest(State(spans): State<CollectedSpans>, Json(payload): Json<Value>) -> StatusCode {
        if let Some(events) = payload.get("events").and_then(Value::as_array) {
            spans.lock().unwrap().extend(events.iter().cloned());
        }
        StatusCode::OK
    }

    let app = Router::new()
        .route("/ingest", post(ingest))
        .with_state(spans.clone());
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    spans
}

#[derive(Clone)]
struct UpstreamState {
    /// Request bodies POSTed to /messages are forwarded to the SSE stream,
    /// which answers each tool call after a configured delay.
    posted_tx: mpsc::UnboundedSender<Value>,
    posted_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Value>>>>,
    response_delay: Duration,
    /// How many times each result frame is sent (retransmission simulation).
    frame_repeat: usize,
}

/// Start a mock MCP upstream with the two-leg SSE transport: POST `/messages`
/// accepts tool calls, GET `/sse` streams their results.
pub async fn start_sse_upstream(addr: SocketAddr, response_delay: Duration, frame_repeat: usize) {
    let (posted_tx, posted_rx) = mpsc::unbounded_channel();
    let state = UpstreamState {
        posted_tx,
        posted_rx: Arc::new(tokio::sync::Mutex::new(Some(posted_rx))),
        response_delay,
        frame_repeat,
    };

    async fn messages(State(state): State<UpstreamState>, body: String) -> StatusCode {
        if let Ok(msg) = serde_json::from_str::<Value>(&body) {
            let _ = state.posted_tx.send(msg);
        }
        StatusCode::ACCEPTED
    }

    async fn sse(State(state): State<UpstreamState>) -> Response {
        let Some(mut rx) = state.posted_rx.lock().await.take() else {
            return StatusCode::CONFLICT.into_response();
        };
        let delay = state.response_delay;
        let repeat = state.frame_repeat;
        let stream = async_stream_frames(move |tx| async move {
            let _ = tx.send(": connected\n\n".to_string());
            while let Some(call) = rx.recv().await {
                tokio::time::sleep(delay).await;
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": call["id"],
                    "result": {"ok": true}
                });
                for _ in 0..repeat.max(1) {
                    let _ = tx.send(format!("data: {}\n\n", reply));
                }
            }
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .body(Body::from_stream(stream))
            .unwrap()
    }

    let app = Router::new()
        .route("/messages", post(messages))
        .route("/sse", get(sse))
        .with_state(state);
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

fn async_stream_frames<F, Fut>(
    producer: F,
) -> impl futures_util::Stream<Item = Result<String, std::convert::Infallible>>
where
    F: FnOnce(mpsc::UnboundedSender<String>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(producer(tx));
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok(frame), rx))
    })
}

/// Start a mock upstream that streams plain-text chunks forever on every
/// path. The body never completes, so anything that buffers it hangs.
pub async fn start_endless_plain_upstream(addr: SocketAddr) {
    let app = Router::new().fallback(|| async {
        let stream = async_stream_frames(|tx| async move {
            loop {
                if tx.send("tick\n".to_string()).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Body::from_stream(stream))
            .unwrap()
    });
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// Start a mock upstream that answers every request with a fixed body.
pub async fn start_fixed_upstream(addr: SocketAddr, status: StatusCode, body: &'static str) {
    let app = Router::new().fallback(move || async move {
        (status, [("content-type", "application/json")], body)
    });
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
}

/// Poll until `predicate` passes or the timeout elapses.
pub async fn wait_for<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}
