//! Per-bridge configuration

use std::time::Duration;

use crate::config::WebSocketSettings;
use crate::topics::framework::{CLIENT_CLOSED, CLIENT_READY};

/// Configuration for one [`Bridge`](super::Bridge)
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Channel name; derives the route and topic names
    pub channel: String,
    /// Capacity of each client's outbound queue
    pub outbound_capacity: usize,
    pub max_connections: usize,
    /// Deadline for a single frame write
    pub write_timeout: Duration,
    /// A reader with no inbound traffic for this long is closed
    pub pong_timeout: Duration,
    pub ping_interval: Duration,
    pub max_message_bytes: usize,
    /// Topic announcing a registered client
    pub ready_topic: Option<String>,
    /// Topic announcing a departed client
    pub closed_topic: Option<String>,
}

impl BridgeConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self::from_settings(channel, &WebSocketSettings::default())
    }

    /// Build from the `[websocket]` config section
    pub fn from_settings(channel: impl Into<String>, settings: &WebSocketSettings) -> Self {
        Self {
            channel: channel.into(),
            outbound_capacity: settings.outbound_capacity.max(1),
            max_connections: settings.max_connections,
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            pong_timeout: Duration::from_secs(settings.pong_timeout_secs),
            ping_interval: Duration::from_secs(settings.ping_interval_secs.max(1)),
            max_message_bytes: settings.max_message_bytes,
            ready_topic: Some(CLIENT_READY.to_string()),
            closed_topic: Some(CLIENT_CLOSED.to_string()),
        }
    }

    /// Builder method: set the outbound queue capacity
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Builder method: set the connection limit
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    /// Builder method: set the write deadline
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Builder method: set ping interval and pong timeout
    pub fn keepalive(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    /// Builder method: set (or clear) the ready topic
    pub fn ready_topic(mut self, topic: Option<&str>) -> Self {
        self.ready_topic = topic.map(str::to_string);
        self
    }

    /// Builder method: set (or clear) the closed topic
    pub fn closed_topic(mut self, topic: Option<&str>) -> Self {
        self.closed_topic = topic.map(str::to_string);
        self
    }
}
