//! Per-connection reader and writer
//!
//! Both loops run inside one task; whichever finishes first ends the
//! connection and triggers unregistration.

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::ClientHandle;
use super::runtime::Shared;
use crate::pubsub::Message;
use crate::topics::{validate_topic_name, TopicScope};

/// Payload of the client ready and closed events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub endpoint: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

/// Serve one upgraded socket until it closes or the bridge shuts down
pub(crate) async fn serve(
    socket: WebSocket,
    user_id: String,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let id = Uuid::new_v4().to_string();
    let channel = shared.config.channel.as_str();
    let (tx, rx) = mpsc::channel(shared.config.outbound_capacity);
    let (mut sink, stream) = socket.split();

    let client = ClientHandle::new(id.clone(), user_id.clone(), tx);
    if let Err(err) = shared.hub.register(client).await {
        warn!(
            channel = %channel,
            user_id = %user_id,
            error = %err,
            "Failed to register WebSocket connection"
        );
        let frame = WsMessage::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: err.to_string().into(),
        }));
        let _ = tokio::time::timeout(shared.config.write_timeout, sink.send(frame)).await;
        return;
    }

    info!(channel = %channel, connection_id = %id, user_id = %user_id, "WebSocket connected");
    announce(&shared, shared.config.ready_topic.as_deref(), &user_id).await;

    let reason = tokio::select! {
        _ = write_loop(sink, rx, &id, &shared) => "writer finished",
        _ = read_loop(stream, &id, &user_id, &shared, &shutdown) => "reader finished",
        _ = shutdown.cancelled() => "bridge shutting down",
    };

    shared.hub.unregister(&id).await;
    info!(
        channel = %channel,
        connection_id = %id,
        user_id = %user_id,
        reason,
        "WebSocket disconnected"
    );
    announce(&shared, shared.config.closed_topic.as_deref(), &user_id).await;
}

async fn announce(shared: &Shared, topic: Option<&str>, user_id: &str) {
    let Some(topic) = topic else {
        return;
    };
    let event = ClientEvent {
        endpoint: shared.config.channel.clone(),
        user_id: user_id.to_string(),
    };
    let message = match Message::json(topic, &event) {
        Ok(message) => message,
        Err(err) => {
            warn!(topic = %topic, error = %err, "Failed to encode client event");
            return;
        }
    };
    if let Err(err) = shared.publisher.publish(message).await {
        debug!(topic = %topic, error = %err, "Client event not published");
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Bytes>,
    id: &str,
    shared: &Shared,
) {
    let write_timeout = shared.config.write_timeout;
    let interval = shared.config.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + interval, interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => shared.codec.frame(payload),
                None => {
                    // Closed by the hub
                    let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => WsMessage::Ping(Vec::new()),
        };

        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection_id = %id, error = %err, "WebSocket write failed");
                return;
            }
            Err(_) => {
                debug!(connection_id = %id, "WebSocket write timed out");
                return;
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    id: &str,
    user_id: &str,
    shared: &Shared,
    shutdown: &CancellationToken,
) {
    loop {
        let frame = match tokio::time::timeout(shared.config.pong_timeout, stream.next()).await {
            Err(_) => {
                debug!(connection_id = %id, "No traffic within pong timeout");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                debug!(connection_id = %id, error = %err, "WebSocket receive error");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => relay(shared, shutdown, id, user_id, text.as_bytes()).await,
            WsMessage::Binary(data) => relay(shared, shutdown, id, user_id, &data).await,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Close(_) => {
                debug!(connection_id = %id, "Client requested close");
                return;
            }
        }
    }
}

/// Republish a client frame on the bus
///
/// Malformed frames and unusable targets are logged and dropped; the
/// connection stays open.
async fn relay(
    shared: &Shared,
    shutdown: &CancellationToken,
    id: &str,
    user_id: &str,
    raw: &[u8],
) {
    let channel = shared.config.channel.as_str();
    let inbound = match shared.codec.decode(raw) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!(channel = %channel, connection_id = %id, error = %err, "Malformed client frame dropped");
            return;
        }
    };

    if let Err(err) = validate_topic_name(&inbound.topic) {
        warn!(
            channel = %channel,
            connection_id = %id,
            topic = %inbound.topic,
            error = %err,
            "Client frame names an invalid topic, dropped"
        );
        return;
    }
    match shared.topics.get(&inbound.topic) {
        Ok(topic) if topic.scope == TopicScope::Framework => {
            warn!(
                channel = %channel,
                connection_id = %id,
                topic = %inbound.topic,
                "Clients may not publish framework topics, dropped"
            );
            return;
        }
        Ok(_) => {}
        Err(_) => {
            warn!(
                channel = %channel,
                connection_id = %id,
                topic = %inbound.topic,
                "Client frame names an unregistered topic, dropped"
            );
            return;
        }
    }

    let message = Message::new(inbound.topic, inbound.payload)
        .meta("user_id", user_id)
        .meta("endpoint", channel)
        .meta("connection_id", id);
    if let Err(err) = shared.publisher.publish_with(shutdown, message).await {
        warn!(channel = %channel, connection_id = %id, error = %err, "Failed to publish client frame");
    }
}
