//! At-column zstd compression for high-volume text fields (spec §4.2,
//! §9 "Compression compatibility").
//!
//! A zstd frame's own magic number (`0x28 0xB5 0x2F 0xFD`, little-endian)
//! doubles as the "is this row compressed" marker: rows written before
//! compression was introduced carry plain UTF-8 bytes and never start with
//! that sequence, so `decode` can tell the two apart without a schema
//! version column.

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;

/// Compress `text` into a zstd frame. Always produces magic-prefixed bytes.
pub fn encode(text: &str) -> Vec<u8> {
    zstd::stream::encode_all(text.as_bytes(), ZSTD_LEVEL).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "zstd encode failed, storing plain bytes");
        text.as_bytes().to_vec()
    })
}

/// Decode a column value: if it starts with the zstd magic, decompress it;
/// otherwise treat it as a legacy plain-bytes row and return it unchanged.
pub fn decode(bytes: &[u8]) -> String {
    if bytes.starts_with(&ZSTD_MAGIC) {
        match zstd::stream::decode_all(bytes) {
            Ok(plain) => String::from_utf8_lossy(&plain).into_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "zstd decode failed, treating as plain bytes");
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Canonical (sorted-key) JSON encoding of an attribute map, used both as
/// the compressed attribute blob and — unhashed, as a plain string — as the
/// TSDB bucket fingerprint (SPEC_FULL.md §D.1: fingerprint is semantic, not
/// literal, so two attribute maps that differ only in key order never split
/// a bucket).
pub fn canonical_json(value: &serde_json::Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).unwrap_or_else(|_| "{}".to_string())
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// Compress an attribute map (empty map encodes as `"{}"`, per spec invariant).
pub fn encode_attributes(value: &serde_json::Value) -> Vec<u8> {
    encode(&canonical_json(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_text() {
        let original = "hello, argus";
        let encoded = encode(original);
        assert!(encoded.starts_with(&ZSTD_MAGIC));
        assert_eq!(decode(&encoded), original);
    }

    #[test]
    fn legacy_plain_bytes_pass_through() {
        let legacy = b"plain legacy body, never compressed";
        assert_eq!(decode(legacy), String::from_utf8_lossy(legacy));
    }

    #[test]
    fn empty_attributes_encode_to_empty_object() {
        let empty = serde_json::json!({});
        assert_eq!(canonical_json(&empty), "{}");
        let encoded = encode_attributes(&empty);
        assert!(encoded.starts_with(&ZSTD_MAGIC));
        assert_eq!(decode(&encoded), "{}");
    }

    #[test]
    fn canonical_json_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
