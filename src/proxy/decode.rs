//! Stream decoding: compressed response bodies, JSON message extraction and
//! incremental SSE frame parsing.
//!
//! Everything here degrades instead of erroring: a body that fails to decode
//! is passed through unchanged, and text that fails to parse simply yields no
//! messages. The forwarded byte stream is never affected.

use std::io::Read;

use serde_json::Value;

/// Cap on the SSE reassembly buffer. A pathological upstream that never sends
/// a frame terminator is truncated to the trailing `SSE_BUFFER_RETAIN` bytes.
/// Lossy safety valve, not a protocol feature.
const SSE_BUFFER_MAX: usize = 1024 * 1024;
const SSE_BUFFER_RETAIN: usize = 256 * 1024;

/// Apply the inverse transform declared by `Content-Encoding`.
///
/// On decode failure the original bytes are returned unchanged; downstream
/// JSON parsing will then simply fail gracefully.
pub fn decode_body(bytes: &[u8], content_encoding: Option<&str>) -> Vec<u8> {
    let encoding = match content_encoding {
        Some(e) => e.trim().to_ascii_lowercase(),
        None => return bytes.to_vec(),
    };
    let decoded = match encoding.as_str() {
        "gzip" => read_all(flate2::read::GzDecoder::new(bytes)),
        "deflate" => {
            // zlib-wrapped is the common interpretation; fall back to raw.
            read_all(flate2::read::ZlibDecoder::new(bytes))
                .or_else(|| read_all(flate2::read::DeflateDecoder::new(bytes)))
        }
        "br" => read_all(brotli::Decompressor::new(bytes, 4096)),
        _ => None,
    };
    decoded.unwrap_or_else(|| bytes.to_vec())
}

fn read_all<R: Read>(mut reader: R) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Extract JSON-RPC messages from a buffered body.
///
/// Whole-body parse first (array or single value), falling back to
/// newline-delimited JSON with blank and unparseable lines skipped.
pub fn parse_messages(text: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items,
        Ok(value) => vec![value],
        Err(_) => text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
    }
}

/// Incremental SSE frame parser.
///
/// Text chunks are appended to a buffer; every complete frame (terminated by
/// the earliest blank line, `\n\n` or `\r\n\r\n`) is consumed, its `data:`
/// lines joined and parsed as JSON.
#[derive(Default)]
pub struct SseFrameParser {
    buf: String,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of stream text; returns the JSON messages completed by
    /// this chunk.
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buf.push_str(chunk);
        let mut messages = Vec::new();

        loop {
            let nn = self.buf.find("\n\n");
            let rr = self.buf.find("\r\n\r\n");
            let (sep, sep_len) = match (nn, rr) {
                (None, None) => break,
                (Some(n), None) => (n, 2),
                (None, Some(r)) => (r, 4),
                (Some(n), Some(r)) if n < r => (n, 2),
                (_, Some(r)) => (r, 4),
            };

            let frame = self.buf[..sep].to_string();
            self.buf.drain(..sep + sep_len);
            if frame.trim().is_empty() {
                continue;
            }

            let data_lines: Vec<&str> = frame
                .lines()
                .filter(|l| l.starts_with("data:"))
                .map(|l| l["data:".len()..].trim())
                .collect();
            if data_lines.is_empty() {
                continue;
            }

            if let Ok(msg) = serde_json::from_str(&data_lines.join("\n")) {
                messages.push(msg);
            }
        }

        if self.buf.len() > SSE_BUFFER_MAX {
            let mut start = self.buf.len() - SSE_BUFFER_RETAIN;
            while !self.buf.is_char_boundary(start) {
                start += 1;
            }
            self.buf.drain(..start);
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_decode_gzip_body() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decode_body(&compressed, Some("gzip")), b"{\"ok\":true}");
    }

    #[test]
    fn test_decode_deflate_body() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"[1,2,3]").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decode_body(&compressed, Some("deflate")), b"[1,2,3]");
    }

    #[test]
    fn test_decode_failure_returns_original() {
        let garbage = b"definitely not gzip";
        assert_eq!(decode_body(garbage, Some("gzip")), garbage);
        assert_eq!(decode_body(garbage, Some("br")), garbage);
        assert_eq!(decode_body(garbage, Some("zstd")), garbage);
        assert_eq!(decode_body(garbage, None), garbage);
    }

    #[test]
    fn test_parse_messages_whole_body() {
        assert_eq!(parse_messages(r#"{"id":1}"#), vec![json!({"id":1})]);
        assert_eq!(
            parse_messages(r#"[{"id":1},{"id":2}]"#),
            vec![json!({"id":1}), json!({"id":2})]
        );
    }

    #[test]
    fn test_parse_messages_ndjson_fallback() {
        let text = "{\"id\":1}\n\nnot json\n{\"id\":2}\n";
        assert_eq!(parse_messages(text), vec![json!({"id":1}), json!({"id":2})]);
        assert!(parse_messages("complete garbage").is_empty());
    }

    #[test]
    fn test_sse_parser_frames_across_chunks() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push("data: {\"id\"").is_empty());
        let messages = parser.push(":7}\n\ndata: {\"id\":8}\n");
        assert_eq!(messages, vec![json!({"id":7})]);
        assert_eq!(parser.push("\n"), vec![json!({"id":8})]);
    }

    #[test]
    fn test_sse_parser_crlf_and_multi_data_lines() {
        let mut parser = SseFrameParser::new();
        let messages = parser.push("event: message\r\ndata: [1,\r\ndata: 2]\r\n\r\n");
        assert_eq!(messages, vec![json!([1, 2])]);
    }

    #[test]
    fn test_sse_parser_skips_framed_noise() {
        let mut parser = SseFrameParser::new();
        assert!(parser.push(": keepalive\n\n").is_empty());
        assert!(parser.push("data: not json\n\n").is_empty());
        assert!(parser.push("\n\n\n\n").is_empty());
        // still functional afterwards
        assert_eq!(parser.push("data: 42\n\n"), vec![json!(42)]);
    }

    #[test]
    fn test_sse_buffer_capped() {
        let mut parser = SseFrameParser::new();
        let chunk = "x".repeat(512 * 1024);
        parser.push(&chunk);
        parser.push(&chunk);
        parser.push(&chunk);
        assert!(parser.buf.len() <= SSE_BUFFER_RETAIN + chunk.len());
        // frames arriving after truncation still parse
        assert_eq!(parser.push("\n\ndata: 1\n\n"), vec![json!(1)]);
    }
}
