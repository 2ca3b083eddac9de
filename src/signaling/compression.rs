//! Optional LZ compression of bus payloads above a configured byte
//! threshold (SPEC_FULL.md §4.5). `miniz_oxide` is the teacher's own
//! compression dependency, reused here as the one built-in codec; the
//! configuration's `compression.library` field exists to *name* the codec
//! without hard-coding the abstraction to a single implementation.

use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec;

/// DEFLATE-compress `bytes`.
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    compress_to_vec(bytes, 6)
}

/// Try to inflate `bytes` as DEFLATE output. Returns `None` on failure so
/// the caller can fall back to treating the bytes as plain JSON (the
/// "try-compressed / catch-plain" receive path from SPEC_FULL.md §9).
pub fn try_decompress(bytes: &[u8]) -> Option<Vec<u8>> {
    decompress_to_vec(bytes).ok()
}

/// Encode an envelope for the wire: JSON, then compressed if its length
/// is at or above `threshold`.
pub fn encode(json: &str, enabled: bool, threshold: usize) -> Vec<u8> {
    let bytes = json.as_bytes();
    if enabled && bytes.len() >= threshold {
        compress(bytes)
    } else {
        bytes.to_vec()
    }
}

/// Decode a wire payload back into a JSON string: try decompression
/// first, then fall back to treating the bytes as plain UTF-8 JSON.
pub fn decode(bytes: &[u8]) -> Option<String> {
    if let Some(decompressed) = try_decompress(bytes) {
        if let Ok(s) = String::from_utf8(decompressed) {
            return Some(s);
        }
    }
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_are_not_compressed() {
        let json = r#"{"a":1}"#;
        let encoded = encode(json, true, 1024);
        assert_eq!(encoded, json.as_bytes());
    }

    #[test]
    fn large_payloads_are_compressed_and_round_trip() {
        let json = format!(r#"{{"padding":"{}"}}"#, "x".repeat(2000));
        let encoded = encode(&json, true, 1024);
        assert_ne!(encoded, json.as_bytes());
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, json);
    }

    #[test]
    fn decode_falls_back_to_plain_json_when_not_compressed() {
        let json = r#"{"plain":"yes"}"#;
        let decoded = decode(json.as_bytes()).unwrap();
        assert_eq!(decoded, json);
    }

    #[test]
    fn disabled_compression_never_compresses() {
        let json = format!(r#"{{"padding":"{}"}}"#, "x".repeat(5000));
        let encoded = encode(&json, false, 10);
        assert_eq!(encoded, json.as_bytes());
    }
}
