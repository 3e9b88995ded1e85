//! Inbound and outbound frame conventions
//!
//! The `html` channel speaks the envelope htmx's ws extension sends:
//!
//! ```json
//! {"action": "chat.messages", "body": "hello"}
//! {"HEADERS": {"HX-Trigger-Name": "chat.messages"}, "body": "hello"}
//! ```
//!
//! Every other channel uses a typed envelope:
//!
//! ```json
//! {"topic": "chat.messages", "payload": {"body": "hello"}}
//! ```

use axum::extract::ws::Message as WsMessage;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

const ACTION_KEY: &str = "action";
const HEADERS_KEY: &str = "HEADERS";
const TRIGGER_NAME: &str = "HX-Trigger-Name";

/// A decoded client frame
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Bytes,
}

/// Why a client frame could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame does not name a target topic")]
    MissingTarget,
}

#[derive(Deserialize)]
struct DataEnvelope {
    topic: String,
    #[serde(default)]
    payload: Value,
}

/// Frame convention of a bridge channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Html,
    Data,
}

impl Codec {
    pub fn for_channel(channel: &str) -> Self {
        if channel == "html" {
            Codec::Html
        } else {
            Codec::Data
        }
    }

    /// Decode a client frame into a target topic and payload
    pub fn decode(&self, raw: &[u8]) -> Result<Inbound, DecodeError> {
        match self {
            Codec::Html => decode_html(raw),
            Codec::Data => decode_data(raw),
        }
    }

    /// Frame an outbound payload
    ///
    /// Valid UTF-8 goes out as a text frame, anything else as binary.
    pub fn frame(&self, payload: Bytes) -> WsMessage {
        match String::from_utf8(payload.to_vec()) {
            Ok(text) => WsMessage::Text(text),
            Err(err) => WsMessage::Binary(err.into_bytes()),
        }
    }
}

fn decode_html(raw: &[u8]) -> Result<Inbound, DecodeError> {
    let mut object = match serde_json::from_slice::<Value>(raw)? {
        Value::Object(object) => object,
        _ => return Err(DecodeError::NotAnObject),
    };

    let action = take_string(&mut object, ACTION_KEY);
    let headers = object.remove(HEADERS_KEY);
    let topic = action
        .or_else(|| {
            headers
                .as_ref()
                .and_then(|h| h.get(TRIGGER_NAME))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|t| !t.is_empty())
        .ok_or(DecodeError::MissingTarget)?;

    let payload = serde_json::to_vec(&Value::Object(object))?;
    Ok(Inbound {
        topic,
        payload: Bytes::from(payload),
    })
}

fn decode_data(raw: &[u8]) -> Result<Inbound, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    if value.get("topic").and_then(Value::as_str).map_or(true, str::is_empty) {
        return Err(DecodeError::MissingTarget);
    }
    let envelope: DataEnvelope = serde_json::from_value(value)?;
    let payload = serde_json::to_vec(&envelope.payload)?;
    Ok(Inbound {
        topic: envelope.topic,
        payload: Bytes::from(payload),
    })
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key)? {
        Value::String(s) => Some(s),
        _ => None,
    }
}
