//! Message encoding shared by all transports
//!
//! # Wire Format
//!
//! Every command and feedback message is a UTF-8 JSON object:
//!
//! ```text
//! Socket (TCP/UDP):  {"linear_velocity":0.5,"type":"move"}
//! Serial (JSON mode): {"linear_velocity":0.5,"type":"move"}\n
//! ```
//!
//! - **Socket**: no delimiter. One write on the sender is expected to arrive
//!   as one read on the receiver (one datagram for UDP).
//! - **Serial**: a single `\n` terminates each message. JSON encoding never
//!   emits a raw newline, so the terminator is unambiguous.
//!
//! Keys are emitted in sorted order, so equal messages always encode to the
//! same bytes.

use crate::error::{Error, Result};
use serde_json::Value;

/// Command or feedback payload: string keys to arbitrary JSON values.
///
/// The transport layer does not interpret the contents.
pub type Message = serde_json::Map<String, Value>;

/// Line terminator used by the serial JSON framing
pub const LINE_DELIMITER: u8 = b'\n';

/// Encode a message as compact UTF-8 JSON
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Encode a message followed by the line terminator
pub fn encode_line(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = encode(message)?;
    bytes.push(LINE_DELIMITER);
    Ok(bytes)
}

/// Decode one JSON document into a message
///
/// Surrounding whitespace (including a trailing `\r\n`) is ignored. Documents
/// that are valid JSON but not an object are rejected.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    match serde_json::from_slice::<Value>(bytes.trim_ascii())? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidMessage(format!(
            "expected JSON object, got {}",
            value_kind(&other)
        ))),
    }
}

/// Remove and return the first complete line (terminator included) from `buffer`
pub fn take_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer.iter().position(|&b| b == LINE_DELIMITER)?;
    let rest = buffer.split_off(end + 1);
    Some(std::mem::replace(buffer, rest))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            _ => panic!("test message must be an object"),
        }
    }

    #[test]
    fn test_encode_is_compact_and_sorted() {
        let msg = message(json!({"type": "move", "linear_velocity": 0.5}));
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes, br#"{"linear_velocity":0.5,"type":"move"}"#);
    }

    #[test]
    fn test_encode_line_appends_single_newline() {
        let msg = message(json!({"speed": 100}));
        let bytes = encode_line(&msg).unwrap();
        assert_eq!(bytes, b"{\"speed\":100}\n");
    }

    #[test]
    fn test_newline_in_string_is_escaped() {
        let msg = message(json!({"text": "a\nb"}));
        let bytes = encode_line(&msg).unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == LINE_DELIMITER).count(), 1);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_nested_values() {
        let msg = message(json!({
            "status": "success",
            "position": [1.2, 3.4, 5.6],
            "flags": {"emergency": false, "mode": null}
        }));
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_tolerates_crlf() {
        let decoded = decode(b"{\"speed\":100}\r\n").unwrap();
        assert_eq!(decoded, message(json!({"speed": 100})));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert!(matches!(decode(b"[1,2,3]"), Err(Error::InvalidMessage(_))));
        assert!(matches!(decode(b"42"), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(decode(b"{\"speed\":"), Err(Error::Json(_))));
        assert!(matches!(decode(&[0xff, 0xfe]), Err(Error::Json(_))));
    }

    #[test]
    fn test_take_line_keeps_remainder() {
        let mut buffer = b"{\"a\":1}\n{\"b\":2}\n{\"c\"".to_vec();
        assert_eq!(take_line(&mut buffer).unwrap(), b"{\"a\":1}\n");
        assert_eq!(take_line(&mut buffer).unwrap(), b"{\"b\":2}\n");
        assert_eq!(take_line(&mut buffer), None);
        assert_eq!(buffer, b"{\"c\"");
    }
}
