//! W3C `traceparent` header parsing and formatting.
//!
//! A malformed or missing header is treated as absent; the proxy then mints a
//! fresh trace. Nothing on this path is ever surfaced to the caller as an
//! error.

use crate::telemetry::ids::{new_span_id, new_trace_id};

/// Trace context inherited from (or minted for) one inbound request.
///
/// Immutable once created for that request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a `traceparent` header value.
///
/// The header must split into exactly 4 dash-separated segments with a 32-hex
/// trace id and a 16-hex span id; anything else yields `None`.
pub fn parse_traceparent(header: Option<&str>) -> Option<TraceContext> {
    let header = header?;
    let parts: Vec<&str> = header.trim().split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let (trace_id, span_id) = (parts[1], parts[2]);
    if !is_hex(trace_id, 32) || !is_hex(span_id, 16) {
        return None;
    }
    Some(TraceContext {
        trace_id: trace_id.to_lowercase(),
        parent_span_id: Some(span_id.to_lowercase()),
    })
}

/// Return the existing context unchanged, or mint a fresh parentless one.
pub fn ensure_trace_context(existing: Option<TraceContext>) -> TraceContext {
    existing.unwrap_or_else(|| TraceContext {
        trace_id: new_trace_id(),
        parent_span_id: None,
    })
}

/// Allocate a fresh span id, reusing `trace_id` if given.
pub fn next_span(trace_id: Option<&str>) -> (String, String) {
    let trace_id = trace_id.map(str::to_owned).unwrap_or_else(new_trace_id);
    (trace_id, new_span_id())
}

/// Render `00-{traceId}-{spanId}-{01|00}`.
pub fn make_traceparent(trace_id: &str, span_id: &str, sampled: bool) -> String {
    let flags = if sampled { "01" } else { "00" };
    format!("00-{}-{}-{}", trace_id, span_id, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let trace_id = new_trace_id();
        let span_id = new_span_id();
        let header = make_traceparent(&trace_id, &span_id, true);
        let ctx = parse_traceparent(Some(&header)).unwrap();
        assert_eq!(ctx.trace_id, trace_id);
        assert_eq!(ctx.parent_span_id.as_deref(), Some(span_id.as_str()));
    }

    #[test]
    fn test_uppercase_hex_accepted_and_lowercased() {
        let header = "00-0AF7651916CD43DD8448EB211C80319C-B7AD6B7169203331-01";
        let ctx = parse_traceparent(Some(header)).unwrap();
        assert_eq!(ctx.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
    }

    #[test]
    fn test_malformed_headers_are_absent() {
        for bad in [
            "",
            "garbage",
            "00-abc-def-01",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
            "00-zzf7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-zzad6b7169203331-01",
        ] {
            assert!(parse_traceparent(Some(bad)).is_none(), "accepted {:?}", bad);
        }
        assert!(parse_traceparent(None).is_none());
    }

    #[test]
    fn test_ensure_mints_distinct_traces() {
        let a = ensure_trace_context(None);
        let b = ensure_trace_context(None);
        assert_ne!(a.trace_id, b.trace_id);
        assert!(a.parent_span_id.is_none());
    }

    #[test]
    fn test_ensure_passes_existing_through() {
        let ctx = TraceContext {
            trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
            parent_span_id: None,
        };
        assert_eq!(ensure_trace_context(Some(ctx.clone())), ctx);
    }

    #[test]
    fn test_next_span_reuses_trace_id() {
        let (trace_id, span_id) = next_span(Some("0af7651916cd43dd8448eb211c80319c"));
        assert_eq!(trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(span_id.len(), 16);
    }
}
