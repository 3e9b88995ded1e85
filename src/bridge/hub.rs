//! WebSocket Connection Hub
//!
//! One event loop per bridge owns every connection record. Connections,
//! subscriptions and in-process producers talk to it through [`Hub`], a
//! cloneable handle that turns calls into events on a channel; nothing else
//! touches hub state, so it needs no locks.
//!
//! Each record holds the only sender of its connection's outbound queue.
//! Dropping the record (on unregister, eviction or loop exit) closes that
//! queue, which ends the connection's writer.

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{BridgeError, BridgeResult};

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

const EVENT_CAPACITY: usize = 1024;

/// Connection counts reported by the hub
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
}

/// A connection as the hub sees it
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ConnectionId,
    pub user_id: String,
    outbound: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    pub fn new(id: ConnectionId, user_id: String, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            user_id,
            outbound,
        }
    }
}

enum HubEvent {
    Register {
        client: ClientHandle,
        ack: oneshot::Sender<BridgeResult<()>>,
    },
    Unregister(ConnectionId),
    Broadcast(Bytes),
    Direct {
        user_id: String,
        payload: Bytes,
    },
    Stats(oneshot::Sender<HubStats>),
    ConnectionsFor {
        user_id: String,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle for sending events to a hub event loop
#[derive(Clone)]
pub struct Hub {
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    /// Create a hub handle and the loop it feeds
    pub fn new(channel: &str, max_connections: usize) -> (Self, HubLoop) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let event_loop = HubLoop {
            channel: channel.to_string(),
            max_connections,
            events: rx,
            connections: HashMap::new(),
            by_user: HashMap::new(),
        };
        (Self { events: tx }, event_loop)
    }

    /// Add a connection; fails when the hub is full or gone
    pub async fn register(&self, client: ClientHandle) -> BridgeResult<()> {
        let (ack, reply) = oneshot::channel();
        self.send(HubEvent::Register { client, ack }).await?;
        reply.await.map_err(|_| BridgeError::HubClosed)?
    }

    /// Remove a connection; a no-op if it was already evicted
    pub async fn unregister(&self, id: &str) {
        let _ = self.send(HubEvent::Unregister(id.to_string())).await;
    }

    /// Queue `payload` for every live connection
    pub async fn broadcast(&self, payload: Bytes) -> BridgeResult<()> {
        self.send(HubEvent::Broadcast(payload)).await
    }

    /// Queue `payload` for every live connection of one user
    pub async fn direct(&self, user_id: &str, payload: Bytes) -> BridgeResult<()> {
        self.send(HubEvent::Direct {
            user_id: user_id.to_string(),
            payload,
        })
        .await
    }

    pub async fn stats(&self) -> BridgeResult<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Stats(reply)).await?;
        rx.await.map_err(|_| BridgeError::HubClosed)
    }

    /// Number of live connections belonging to `user_id`
    pub async fn connections_for(&self, user_id: &str) -> BridgeResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::ConnectionsFor {
            user_id: user_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::HubClosed)
    }

    async fn send(&self, event: HubEvent) -> BridgeResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| BridgeError::HubClosed)
    }
}

/// The hub's event loop and the state only it may touch
pub struct HubLoop {
    channel: String,
    max_connections: usize,
    events: mpsc::Receiver<HubEvent>,
    connections: HashMap<ConnectionId, ClientHandle>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

impl HubLoop {
    /// Process events until `shutdown` fires or every handle is dropped
    ///
    /// On exit all remaining outbound queues are closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(channel = %self.channel, "Hub event loop started");
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event);
        }

        let remaining = self.connections.len();
        self.by_user.clear();
        self.connections.clear();
        info!(
            channel = %self.channel,
            closed = remaining,
            "Hub event loop stopped"
        );
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register { client, ack } => {
                let _ = ack.send(self.register(client));
            }
            HubEvent::Unregister(id) => {
                if self.remove(&id) {
                    debug!(channel = %self.channel, connection_id = %id, "Connection unregistered");
                }
            }
            HubEvent::Broadcast(payload) => {
                let ids: Vec<ConnectionId> = self.connections.keys().cloned().collect();
                self.deliver(&ids, &payload);
            }
            HubEvent::Direct { user_id, payload } => {
                let ids: Vec<ConnectionId> = match self.by_user.get(&user_id) {
                    Some(ids) => ids.iter().cloned().collect(),
                    None => {
                        debug!(channel = %self.channel, user_id = %user_id, "No live connections, direct message dropped");
                        return;
                    }
                };
                self.deliver(&ids, &payload);
            }
            HubEvent::Stats(reply) => {
                let _ = reply.send(HubStats {
                    connections: self.connections.len(),
                    users: self.by_user.len(),
                });
            }
            HubEvent::ConnectionsFor { user_id, reply } => {
                let _ = reply.send(self.by_user.get(&user_id).map_or(0, HashSet::len));
            }
        }
    }

    fn register(&mut self, client: ClientHandle) -> BridgeResult<()> {
        if self.connections.len() >= self.max_connections {
            warn!(
                channel = %self.channel,
                user_id = %client.user_id,
                limit = self.max_connections,
                "Connection limit reached, registration rejected"
            );
            return Err(BridgeError::TooManyConnections {
                limit: self.max_connections,
            });
        }

        self.by_user
            .entry(client.user_id.clone())
            .or_default()
            .insert(client.id.clone());
        debug!(
            channel = %self.channel,
            connection_id = %client.id,
            user_id = %client.user_id,
            "Connection registered"
        );
        self.connections.insert(client.id.clone(), client);
        Ok(())
    }

    /// Drop a record from both indexes, closing its queue
    fn remove(&mut self, id: &str) -> bool {
        let Some(client) = self.connections.remove(id) else {
            return false;
        };
        if let Some(ids) = self.by_user.get_mut(&client.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_user.remove(&client.user_id);
            }
        }
        true
    }

    /// Non-blocking send to each connection; full queues are evicted
    fn deliver(&mut self, ids: &[ConnectionId], payload: &Bytes) {
        let mut gone = Vec::new();
        for id in ids {
            let Some(client) = self.connections.get(id) else {
                continue;
            };
            match client.outbound.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        channel = %self.channel,
                        connection_id = %id,
                        user_id = %client.user_id,
                        "Client outbound queue full, evicting slow client"
                    );
                    gone.push(id.clone());
                }
                Err(TrySendError::Closed(_)) => gone.push(id.clone()),
            }
        }
        for id in gone {
            self.remove(&id);
        }
    }
}
