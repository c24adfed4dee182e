//! Payload encoding and the bridge frame layout.
//!
//! # Payload formats
//!
//! | Format   | encode                          | decode                                  |
//! |----------|---------------------------------|-----------------------------------------|
//! | `json`   | `serde_json` text               | JSON value (strings as text), else text |
//! | `string` | UTF-8 text (JSON for non-text)  | UTF-8 text                              |
//! | `bytes`  | raw bytes (UTF-8 for text)      | raw bytes                               |
//!
//! # Bridge frames
//!
//! Published topics travel as three frames so that the robotics bridge can
//! deserialize them without a schema:
//!
//! ```text
//! frame 0: topic name, UTF-8
//! frame 1: u32 LE = len(frame 2)
//! frame 2: u32 LE = len(content) ++ content (UTF-8)
//! ```

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;

use crate::{config::MessageFormat, error::TransferError, Result};

/// An application payload before encoding or after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    /// True for empty text, empty bytes, JSON null, `""`, `[]` and `{}`.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(Value::Null) => true,
            Payload::Json(Value::String(s)) => s.is_empty(),
            Payload::Json(Value::Array(a)) => a.is_empty(),
            Payload::Json(Value::Object(o)) => o.is_empty(),
            Payload::Json(_) => false,
            Payload::Text(s) => s.is_empty(),
            Payload::Bytes(b) => b.is_empty(),
        }
    }

    /// Borrows the payload as text when it is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Converts into a JSON value. Bytes become an array of numbers.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(v) => v,
            Payload::Text(s) => Value::String(s),
            Payload::Bytes(b) => Value::Array(b.into_iter().map(Value::from).collect()),
        }
    }

    /// Content bytes as carried in the bridge payload frame.
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        encode(self, MessageFormat::String)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Json(v) => write!(f, "{v}"),
            Payload::Text(s) => f.write_str(s),
            Payload::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

/// Encodes a payload for the wire.
///
/// A payload that cannot be represented in `format` yields
/// `TransferError::Serialization`; callers send nothing in that case.
pub fn encode(payload: &Payload, format: MessageFormat) -> Result<Vec<u8>> {
    match (format, payload) {
        (MessageFormat::Json, Payload::Json(v)) => Ok(serde_json::to_vec(v)?),
        (MessageFormat::Json, Payload::Text(s)) => Ok(serde_json::to_vec(s)?),
        (MessageFormat::Json, Payload::Bytes(_)) => Err(TransferError::Serialization(
            "raw bytes cannot be encoded as json".into(),
        )),

        (MessageFormat::String, Payload::Text(s)) => Ok(s.as_bytes().to_vec()),
        (MessageFormat::String, Payload::Json(Value::String(s))) => Ok(s.as_bytes().to_vec()),
        (MessageFormat::String, Payload::Json(v)) => Ok(v.to_string().into_bytes()),
        (MessageFormat::String, Payload::Bytes(b)) => match std::str::from_utf8(b) {
            Ok(_) => Ok(b.clone()),
            Err(e) => Err(TransferError::Serialization(format!(
                "payload is not valid utf-8: {e}"
            ))),
        },

        (MessageFormat::Bytes, Payload::Bytes(b)) => Ok(b.clone()),
        (MessageFormat::Bytes, Payload::Text(s)) => Ok(s.as_bytes().to_vec()),
        (MessageFormat::Bytes, Payload::Json(Value::String(s))) => Ok(s.as_bytes().to_vec()),
        (MessageFormat::Bytes, Payload::Json(v)) => Ok(serde_json::to_vec(v)?),
    }
}

/// Decodes wire bytes.
///
/// Under `json`, a top-level JSON string decodes to `Payload::Text`, so text
/// survives an encode/decode round trip. Input that is not valid JSON falls
/// back to the UTF-8 text. Only input that is neither JSON nor UTF-8 (or not
/// UTF-8 under `string`) is an error.
pub fn decode(data: &[u8], format: MessageFormat) -> Result<Payload> {
    match format {
        MessageFormat::Bytes => Ok(Payload::Bytes(data.to_vec())),
        MessageFormat::String => utf8(data).map(Payload::Text),
        MessageFormat::Json => match serde_json::from_slice::<Value>(data) {
            Ok(Value::String(s)) => Ok(Payload::Text(s)),
            Ok(value) => Ok(Payload::Json(value)),
            Err(_) => utf8(data).map(Payload::Text),
        },
    }
}

fn utf8(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| TransferError::Deserialization(format!("payload is not valid utf-8: {e}")))
}

/// A parsed bridge message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    pub topic: String,
    pub content: Vec<u8>,
}

impl FrameMessage {
    pub fn content_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.content)
            .map_err(|e| TransferError::Deserialization(format!("content is not valid utf-8: {e}")))
    }
}

/// Builds the three bridge frames for `content` published on `topic`.
pub fn build_frames(topic: &str, content: &[u8]) -> Result<[Vec<u8>; 3]> {
    let content_len = wire_len(content.len())?;
    let mut payload = BytesMut::with_capacity(4 + content.len());
    payload.put_u32_le(content_len);
    payload.put_slice(content);

    let payload_len = wire_len(payload.len())?;
    let mut length = BytesMut::with_capacity(4);
    length.put_u32_le(payload_len);

    Ok([
        topic.as_bytes().to_vec(),
        length.to_vec(),
        payload.to_vec(),
    ])
}

fn wire_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| TransferError::Serialization(format!("frame of {len} bytes exceeds u32")))
}

/// Parses three bridge frames, rejecting any length mismatch.
pub fn parse_frames<T: AsRef<[u8]>>(frames: &[T]) -> Result<FrameMessage> {
    let [topic, length, payload] = frames else {
        return Err(TransferError::MalformedFrame(format!(
            "expected 3 frames, got {}",
            frames.len()
        )));
    };
    let (topic, length, payload) = (topic.as_ref(), length.as_ref(), payload.as_ref());

    let declared = read_length_frame(length)?;
    if declared != payload.len() {
        return Err(TransferError::MalformedFrame(format!(
            "length frame says {declared} bytes, payload frame has {}",
            payload.len()
        )));
    }

    let content = split_prefixed(payload).ok_or_else(|| {
        TransferError::MalformedFrame("payload frame has an inconsistent content prefix".into())
    })?;

    let topic = std::str::from_utf8(topic)
        .map_err(|e| TransferError::MalformedFrame(format!("topic is not valid utf-8: {e}")))?;

    Ok(FrameMessage {
        topic: topic.to_string(),
        content: content.to_vec(),
    })
}

/// Reads a length frame, which must be exactly four bytes.
pub fn read_length_frame(frame: &[u8]) -> Result<usize> {
    if frame.len() != 4 {
        return Err(TransferError::MalformedFrame(format!(
            "length frame must be 4 bytes, got {}",
            frame.len()
        )));
    }
    let mut buf = frame;
    Ok(buf.get_u32_le() as usize)
}

/// Strips the inner content prefix when it is consistent with the frame,
/// otherwise returns the frame unchanged.
pub fn unwrap_bridge_payload(payload: &[u8]) -> &[u8] {
    split_prefixed(payload).unwrap_or(payload)
}

fn split_prefixed(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() < 4 {
        return None;
    }
    let (mut prefix, content) = payload.split_at(4);
    (prefix.get_u32_le() as usize == content.len()).then_some(content)
}

/// Renders a payload for logging, truncated to `max_len` characters.
pub fn preview(payload: &Payload, max_len: usize) -> String {
    truncate(&payload.to_string(), max_len)
}

pub(crate) fn truncate(text: &str, max_len: usize) -> String {
    match text.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_round_trip() {
        let payload = Payload::Json(json!({"x": 1.5, "tags": ["a", "b"], "ok": true}));
        let bytes = encode(&payload, MessageFormat::Json).unwrap();
        assert_eq!(decode(&bytes, MessageFormat::Json).unwrap(), payload);
    }

    #[test]
    fn test_text_round_trip_under_json() {
        let payload = Payload::Text("hi \"there\"".into());
        let bytes = encode(&payload, MessageFormat::Json).unwrap();
        assert_eq!(bytes, br#""hi \"there\"""#);
        assert_eq!(decode(&bytes, MessageFormat::Json).unwrap(), payload);

        let bytes = encode(&Payload::Json(json!("hi")), MessageFormat::Json).unwrap();
        assert_eq!(
            decode(&bytes, MessageFormat::Json).unwrap(),
            Payload::Text("hi".into())
        );
    }

    #[test]
    fn test_string_round_trip() {
        let payload = Payload::Text("héllo wörld".into());
        let bytes = encode(&payload, MessageFormat::String).unwrap();
        assert_eq!(bytes, "héllo wörld".as_bytes());
        assert_eq!(decode(&bytes, MessageFormat::String).unwrap(), payload);
    }

    #[test]
    fn test_bytes_pass_through() {
        let raw = vec![0u8, 159, 146, 150, 255];
        let bytes = encode(&Payload::Bytes(raw.clone()), MessageFormat::Bytes).unwrap();
        assert_eq!(bytes, raw);
        assert_eq!(
            decode(&bytes, MessageFormat::Bytes).unwrap(),
            Payload::Bytes(raw)
        );
    }

    #[test]
    fn test_json_decode_falls_back_to_text() {
        assert_eq!(
            decode(b"hello world", MessageFormat::Json).unwrap(),
            Payload::Text("hello world".into())
        );
    }

    #[test]
    fn test_undecodable_input_is_an_error() {
        let invalid = [0xff, 0xfe, 0xfd];
        assert!(matches!(
            decode(&invalid, MessageFormat::Json),
            Err(TransferError::Deserialization(_))
        ));
        assert!(decode(&invalid, MessageFormat::String).is_err());
    }

    #[test]
    fn test_bytes_under_json_fail_to_encode() {
        let err = encode(&Payload::Bytes(vec![1, 2]), MessageFormat::Json).unwrap_err();
        assert!(matches!(err, TransferError::Serialization(_)));
    }

    #[test]
    fn test_string_format_renders_structured_values() {
        let bytes = encode(&Payload::Json(json!({"a": 1})), MessageFormat::String).unwrap();
        assert_eq!(bytes, br#"{"a":1}"#);
        let bytes = encode(&Payload::Json(json!("plain")), MessageFormat::String).unwrap();
        assert_eq!(bytes, b"plain");
    }

    #[test]
    fn test_build_frames_layout() {
        let frames = build_frames("/chatter", b"hi").unwrap();
        assert_eq!(frames[0], b"/chatter");
        assert_eq!(frames[1], vec![6, 0, 0, 0]);
        assert_eq!(frames[2], vec![2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_frames_round_trip() {
        for (topic, content) in [("news", "hello world"), ("/odom", ""), ("t", "ünïcødé")] {
            let frames = build_frames(topic, content.as_bytes()).unwrap();
            let parsed = parse_frames(&frames).unwrap();
            assert_eq!(parsed.topic, topic);
            assert_eq!(parsed.content_str().unwrap(), content);
        }
    }

    #[test]
    fn test_corrupted_length_is_malformed() {
        let mut frames = build_frames("news", b"hello").unwrap();
        frames[1] = vec![99, 0, 0, 0];
        assert!(matches!(
            parse_frames(&frames),
            Err(TransferError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_short_or_missing_frames_are_malformed() {
        assert!(parse_frames(&[b"news".to_vec(), vec![1, 0]]).is_err());
        assert!(parse_frames(&[b"news".to_vec(), vec![1, 0], b"x".to_vec()]).is_err());
        assert!(parse_frames(&[b"news".to_vec(), vec![2, 0, 0, 0], b"xy".to_vec()]).is_err());
    }

    #[test]
    fn test_unwrap_bridge_payload() {
        let frames = build_frames("news", b"hello").unwrap();
        assert_eq!(unwrap_bridge_payload(&frames[2]), b"hello");
        assert_eq!(unwrap_bridge_payload(b"hello world"), b"hello world");
    }

    #[test]
    fn test_payload_is_empty() {
        assert!(Payload::Text(String::new()).is_empty());
        assert!(Payload::Json(Value::Null).is_empty());
        assert!(Payload::Json(json!({})).is_empty());
        assert!(!Payload::Json(json!(0)).is_empty());
        assert!(!Payload::Bytes(vec![0]).is_empty());
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let payload = Payload::Text("ééééé".into());
        assert_eq!(preview(&payload, 3), "ééé...");
        assert_eq!(preview(&payload, 10), "ééééé");
    }
}
