//! Pub/sub message type

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::topics::framework::RECIPIENT_ID;

/// String metadata attached to a message
pub type Metadata = BTreeMap<String, String>;

/// A message travelling over the bus
///
/// The payload is opaque to the bus; `Bytes` keeps fan-out to many
/// subscribers cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with no metadata
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Create a message whose payload is `value` serialized as JSON
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(topic, payload))
    }

    /// Builder method: add a metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builder method: address the message to one user
    pub fn with_recipient(self, user_id: impl Into<String>) -> Self {
        self.meta(RECIPIENT_ID, user_id)
    }

    /// Recipient of a direct message, if any
    pub fn recipient_id(&self) -> Option<&str> {
        self.metadata
            .get(RECIPIENT_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Decode the payload as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
