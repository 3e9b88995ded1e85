//! Framework topic catalogue
//!
//! Names that cross component boundaries are defined here once. Bridge
//! topics are derived from the channel name: `ws.<channel>.broadcast` and
//! `ws.<channel>.direct`.

use std::sync::{Arc, OnceLock};

use super::error::TopicResult;
use super::manager::TopicManager;
use super::topic::{define_framework, Topic, TopicConfig};

/// Emitted after a WebSocket client registered with a bridge
pub const CLIENT_READY: &str = "ws.client.ready";
/// Emitted after a WebSocket client left a bridge
pub const CLIENT_CLOSED: &str = "ws.client.closed";
/// A user's first session came online
pub const PRESENCE_ONLINE: &str = "presence.user.online";
/// A user's last session went away
pub const PRESENCE_OFFLINE: &str = "presence.user.offline";
/// All modules booted
pub const SERVER_STARTED: &str = "server.started";
/// Shutdown began
pub const SERVER_STOPPING: &str = "server.stopping";

/// Metadata key naming the recipient of a direct message
pub const RECIPIENT_ID: &str = "recipient_id";

/// Broadcast topic of a bridge channel
pub fn broadcast_topic(channel: &str) -> String {
    format!("ws.{channel}.broadcast")
}

/// Direct (per-user) topic of a bridge channel
pub fn direct_topic(channel: &str) -> String {
    format!("ws.{channel}.direct")
}

/// Topics owned by the runtime for the given bridge channels
pub fn catalogue(channels: &[&str]) -> Vec<Topic> {
    let mut topics = Vec::with_capacity(channels.len() * 2 + 6);

    for channel in channels {
        topics.push(define_framework(
            TopicConfig::new(
                broadcast_topic(channel),
                format!("Payloads delivered to every client on the {channel} bridge"),
            )
            .pattern("ws.{channel}.broadcast")
            .meta("channel", *channel),
        ));
        topics.push(define_framework(
            TopicConfig::new(
                direct_topic(channel),
                format!("Payloads delivered to one user's clients on the {channel} bridge"),
            )
            .pattern("ws.{channel}.direct")
            .meta("channel", *channel)
            .meta("requires", RECIPIENT_ID),
        ));
    }

    topics.push(define_framework(
        TopicConfig::new(CLIENT_READY, "A WebSocket client finished registering")
            .example(r#"{"endpoint":"html","userID":"alice"}"#),
    ));
    topics.push(define_framework(
        TopicConfig::new(CLIENT_CLOSED, "A WebSocket client disconnected")
            .example(r#"{"endpoint":"html","userID":"alice"}"#),
    ));
    topics.push(define_framework(
        TopicConfig::new(PRESENCE_ONLINE, "A user opened their first session")
            .example(r#"{"userID":"alice"}"#),
    ));
    topics.push(define_framework(
        TopicConfig::new(PRESENCE_OFFLINE, "A user closed their last session")
            .example(r#"{"userID":"alice"}"#),
    ));
    topics.push(define_framework(TopicConfig::new(
        SERVER_STARTED,
        "Every module has booted",
    )));
    topics.push(define_framework(TopicConfig::new(
        SERVER_STOPPING,
        "Graceful shutdown has begun",
    )));

    topics
}

/// Register the framework catalogue with a manager
pub fn register_framework_topics(manager: &TopicManager, channels: &[&str]) -> TopicResult<()> {
    manager.register_all(catalogue(channels))
}

static DEFAULT_MANAGER: OnceLock<Arc<TopicManager>> = OnceLock::new();

/// Process-wide topic manager for entry points that cannot receive one
///
/// Components should take their manager by injection; this accessor exists for
/// code that has no construction path to thread it through.
pub fn default_manager() -> Arc<TopicManager> {
    Arc::clone(DEFAULT_MANAGER.get_or_init(|| Arc::new(TopicManager::new())))
}

/// Make `manager` the process-wide default
///
/// Fails (returning the rejected manager) when a default already exists.
pub fn install_default(manager: Arc<TopicManager>) -> Result<(), Arc<TopicManager>> {
    DEFAULT_MANAGER.set(manager)
}
