// Response envelope normalization
// The API answers either flat (`{...}`) or wrapped (`{"success": true, "data": {...}}`).
// Everything past this module sees the flat shape only.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ApiError;

/// Keys allowed next to `data` for a body to count as an envelope
const ENVELOPE_KEYS: &[&str] = &["data", "success", "message", "status", "meta"];

/// Strip a `{"data": ...}` wrapper if present
pub fn normalize(body: Value) -> Value {
    match body {
        Value::Object(mut map)
            if map.contains_key("data") && map.keys().all(|k| ENVELOPE_KEYS.contains(&k.as_str())) =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Normalize and decode a response body into its canonical typed shape
pub fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    let normalized = normalize(body);
    serde_json::from_value(normalized).map_err(|e| {
        ApiError::ProtocolViolation(format!("Unexpected response shape: {}", e))
    })
}

/// Decode raw response bytes; an empty body decodes as `null`
pub fn decode_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApiError> {
    let value = if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        Value::Null
    } else {
        serde_json::from_slice(bytes)
            .map_err(|e| ApiError::ProtocolViolation(format!("Response is not JSON: {}", e)))?
    };
    decode(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Ack {
        upload_id: String,
    }

    #[test]
    fn test_wrapped_and_flat_decode_identically() {
        let wrapped: Ack = decode(json!({"success": true, "data": {"uploadId": "u1"}})).unwrap();
        let flat: Ack = decode(json!({"uploadId": "u1"})).unwrap();
        assert_eq!(wrapped, flat);
    }

    #[test]
    fn test_payload_with_data_field_is_not_unwrapped() {
        // `data` is a real field here, not an envelope
        let body = json!({"data": [1, 2], "uploadId": "u1"});
        assert_eq!(normalize(body.clone()), body);
    }

    #[test]
    fn test_missing_field_is_protocol_violation() {
        let err = decode::<Ack>(json!({"data": {"totalChunks": 3}})).unwrap_err();
        assert!(matches!(err, ApiError::ProtocolViolation(_)));
    }

    #[test]
    fn test_empty_body_decodes_as_unit() {
        let v: Option<Ack> = decode_bytes(b"").unwrap();
        assert!(v.is_none());
        assert!(decode_bytes::<Ack>(b"not json").is_err());
    }
}
