//! Batched span delivery to the analytics ingest endpoint.
//!
//! Spans are held in a bounded in-memory queue and shipped in batches on a
//! fixed interval, or eagerly once a full batch has accumulated. Delivery is
//! best-effort: when the queue is full the oldest span is evicted, and a
//! batch that exhausts its retries is dropped. Telemetry problems never block
//! or fail the proxied traffic path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::telemetry::span::{IngestPayload, Span, SpanEvent, SCHEMA_VERSION};

const DEFAULT_BATCH_SIZE: usize = 200;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_QUEUE: usize = 10_000;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct TelemetryClientOptions {
    /// Analytics server base URL, e.g. `http://localhost:4000`.
    pub server_url: String,
    pub source_id: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_queue: usize,
}

impl TelemetryClientOptions {
    pub fn new(server_url: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            source_id: source_id.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }
}

pub struct TelemetryClient {
    ingest_url: String,
    source_id: String,
    batch_size: usize,
    flush_interval: Duration,
    max_queue: usize,
    queue: Mutex<VecDeque<SpanEvent>>,
    // Guarantees a flush in progress is never re-entered.
    flush_gate: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    http: reqwest::Client,
}

impl TelemetryClient {
    pub fn new(opts: TelemetryClientOptions) -> Result<Self, url::ParseError> {
        let ingest_url = url::Url::parse(&opts.server_url)?.join("/ingest")?.to_string();
        Ok(Self {
            ingest_url,
            source_id: opts.source_id,
            batch_size: opts.batch_size,
            flush_interval: opts.flush_interval,
            max_queue: opts.max_queue,
            queue: Mutex::new(VecDeque::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            ticker: Mutex::new(None),
            http: reqwest::Client::new(),
        })
    }

    /// Spawn the periodic flush task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }
        let client = Arc::clone(self);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.flush_interval);
            loop {
                interval.tick().await;
                if client.stopped.load(Ordering::SeqCst) {
                    break;
                }
                client.flush().await;
            }
        }));
    }

    /// Stop the flush task; subsequent `record` calls become no-ops.
    /// Unflushed spans may be dropped (best-effort delivery).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = ticker.take() {
            handle.abort();
        }
    }

    /// Enqueue one span, evicting the oldest entry when the queue is full.
    /// Never blocks the caller; triggers an eager flush at a full batch.
    pub fn record(self: &Arc<Self>, span: Span) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let event = SpanEvent {
            event_type: "span".into(),
            schema_version: SCHEMA_VERSION,
            source_id: self.source_id.clone(),
            span,
        };
        let len = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.max_queue {
                queue.pop_front();
            }
            queue.push_back(event);
            queue.len()
        };
        if len >= self.batch_size {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.flush().await });
        }
    }

    /// Drain and deliver up to one batch. Concurrent calls are skipped rather
    /// than queued.
    pub async fn flush(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Ok(_gate) = self.flush_gate.try_lock() else {
            return;
        };
        let batch: Vec<SpanEvent> = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.is_empty() {
                return;
            }
            let take = self.batch_size.min(queue.len());
            queue.drain(..take).collect()
        };
        let payload = IngestPayload {
            schema_version: SCHEMA_VERSION,
            source_id: self.source_id.clone(),
            events: batch,
        };
        if let Err(err) = self.post_with_retry(&payload).await {
            // The batch is lost, not re-queued: losing spans beats unbounded
            // growth when the ingest endpoint is down.
            tracing::debug!(error = %err, events = payload.events.len(), "dropping span batch after retries");
        }
    }

    async fn post_with_retry(&self, payload: &IngestPayload) -> Result<(), String> {
        let mut last_err = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.http.post(&self.ingest_url).json(payload).send().await {
                Ok(res) if res.status().is_success() => return Ok(()),
                Ok(res) => last_err = format!("ingest failed: {}", res.status()),
                Err(err) => last_err = err.to_string(),
            }
            tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
        }
        Err(last_err)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::span::{SpanKind, SpanStatus};

    fn span(name: &str) -> Span {
        Span {
            trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
            span_id: "b7ad6b7169203331".into(),
            parent_span_id: None,
            name: name.into(),
            kind: SpanKind::Server,
            start_time_ms: 0,
            end_time_ms: 1,
            status: SpanStatus::Ok,
            attributes: serde_json::Map::new(),
            error: None,
        }
    }

    fn client_with_max_queue(max_queue: usize) -> Arc<TelemetryClient> {
        let mut opts = TelemetryClientOptions::new("http://127.0.0.1:1", "test");
        opts.max_queue = max_queue;
        Arc::new(TelemetryClient::new(opts).unwrap())
    }

    #[tokio::test]
    async fn test_queue_bounded_evicts_oldest() {
        let client = client_with_max_queue(3);
        for i in 0..5 {
            client.record(span(&format!("s{}", i)));
        }
        assert_eq!(client.queue_len(), 3);
        let queue = client.queue.lock().unwrap();
        let names: Vec<&str> = queue.iter().map(|e| e.span.name.as_str()).collect();
        assert_eq!(names, vec!["s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_record_after_stop_is_noop() {
        let client = client_with_max_queue(10);
        client.record(span("before"));
        client.stop();
        client.record(span("after"));
        assert_eq!(client.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_url_join() {
        let opts = TelemetryClientOptions::new("http://localhost:4000", "test");
        let client = TelemetryClient::new(opts).unwrap();
        assert_eq!(client.ingest_url, "http://localhost:4000/ingest");
    }

    #[tokio::test]
    async fn test_invalid_server_url_rejected() {
        assert!(TelemetryClient::new(TelemetryClientOptions::new("not a url", "test")).is_err());
    }
}
