//! Telemetry subsystem.
//!
//! # Data Flow
//! ```text
//! proxy handlers produce:
//!     → traceparent.rs (parse/propagate W3C trace context)
//!     → ids.rs (random trace/span identifiers)
//!     → span.rs (span event wire types)
//!     → client.rs (bounded queue, batched POST to the ingest endpoint)
//! ```

pub mod client;
pub mod ids;
pub mod span;
pub mod traceparent;

pub use client::{TelemetryClient, TelemetryClientOptions};
pub use span::{now_ms, Span, SpanError, SpanEvent, SpanKind, SpanStatus};
pub use traceparent::{ensure_trace_context, make_traceparent, next_span, parse_traceparent, TraceContext};
