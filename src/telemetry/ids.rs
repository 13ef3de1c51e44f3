//! Random trace and span identifiers.
//!
//! Ids come from the thread-local CSPRNG so that collision probability stays
//! negligible over the lifetime of a high-volume proxy process.

use rand::RngCore;

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut out = String::with_capacity(bytes * 2);
    for b in buf {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// 16-byte trace id, lowercase hex.
pub fn new_trace_id() -> String {
    random_hex(16)
}

/// 8-byte span id, lowercase hex.
pub fn new_span_id() -> String {
    random_hex(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_lengths() {
        assert_eq!(new_trace_id().len(), 32);
        assert_eq!(new_span_id().len(), 16);
    }

    #[test]
    fn test_ids_are_hex() {
        assert!(new_trace_id().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(new_span_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ids_unique_across_calls() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_trace_id()));
        }
    }
}
