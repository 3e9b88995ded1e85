//! Presence module
//!
//! Counts WebSocket sessions per user from the bridges' client events and
//! announces when a user comes online (first session) or goes offline (last
//! session closed). Optionally greets each user on the html channel.
//!
//! - GET /app/presence/online - Users with at least one open session

use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::ClientEvent;
use crate::lifecycle::services::{PUBLISHER, SUBSCRIBER};
use crate::lifecycle::{BootContext, Module, Registrar};
use crate::pubsub::{
    handler_fn, BusError, Handler, Message, Publisher, Subscriber, SubscriptionHandle,
};
use crate::registry::ServiceKey;
use crate::topics::framework::{
    direct_topic, CLIENT_CLOSED, CLIENT_READY, PRESENCE_OFFLINE, PRESENCE_ONLINE,
};

pub const TRACKER: ServiceKey<PresenceTracker> = ServiceKey::new("presence.tracker");

/// `[modules.presence]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Send a welcome fragment to each newly connected html client
    pub welcome: bool,
    /// Channel the welcome fragment goes out on
    pub channel: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            welcome: true,
            channel: "html".to_string(),
        }
    }
}

/// Open session count per user
///
/// Ready and closed events arrive on separate subscriptions and may be
/// handled out of order, so a count can dip below zero transiently.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    sessions: DashMap<String, i64>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn adjust(&self, user_id: &str, delta: i64) -> i64 {
        match self.sessions.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = *entry.get() + delta;
                if count == 0 {
                    entry.remove();
                } else {
                    *entry.get_mut() = count;
                }
                count
            }
            Entry::Vacant(entry) => {
                entry.insert(delta);
                delta
            }
        }
    }

    /// Record a new session; true if the user just came online
    pub fn connect(&self, user_id: &str) -> bool {
        self.adjust(user_id, 1) == 1
    }

    /// Record a closed session; true if the user just went offline
    pub fn disconnect(&self, user_id: &str) -> bool {
        self.adjust(user_id, -1) == 0
    }

    pub fn sessions(&self, user_id: &str) -> usize {
        self.sessions
            .get(user_id)
            .map(|count| (*count).max(0) as usize)
            .unwrap_or(0)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.sessions(user_id) > 0
    }

    /// Online users, sorted
    pub fn online(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self
            .sessions
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| UserPresence {
                user_id: entry.key().clone(),
                sessions: *entry.value() as usize,
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub sessions: usize,
}

/// Payload of `presence.user.online` / `presence.user.offline`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineResponse {
    pub count: usize,
    pub users: Vec<UserPresence>,
}

/// GET /app/presence/online
async fn online(State(tracker): State<Arc<PresenceTracker>>) -> Json<OnlineResponse> {
    let users = tracker.online();
    Json(OnlineResponse {
        count: users.len(),
        users,
    })
}

/// Built-in module tracking who is connected
#[derive(Default)]
pub struct PresenceModule {
    tracker: Arc<PresenceTracker>,
    config: Mutex<PresenceConfig>,
    handles: Mutex<Vec<SubscriptionHandle>>,
}

impl PresenceModule {
    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }
}

fn welcome_fragment(user_id: &str) -> String {
    format!(
        r#"<div id="presence-welcome" hx-swap-oob="true">Welcome, {}</div>"#,
        escape_html(user_id)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

async fn announce(publisher: &dyn Publisher, topic: &str, event: &PresenceEvent) {
    match Message::json(topic, event) {
        Ok(message) => {
            if let Err(e) = publisher.publish(message).await {
                warn!(topic = %topic, user_id = %event.user_id, error = %e, "Presence event not published");
            }
        }
        Err(e) => warn!(topic = %topic, error = %e, "Failed to encode presence event"),
    }
}

fn on_ready(
    tracker: Arc<PresenceTracker>,
    publisher: Arc<dyn Publisher>,
    config: PresenceConfig,
) -> Handler {
    handler_fn(move |message: Message| {
        let tracker = Arc::clone(&tracker);
        let publisher = Arc::clone(&publisher);
        let config = config.clone();
        async move {
            let event: ClientEvent = message.decode().map_err(anyhow::Error::from)?;
            if tracker.connect(&event.user_id) {
                info!(user_id = %event.user_id, endpoint = %event.endpoint, "User online");
                let online = PresenceEvent {
                    user_id: event.user_id.clone(),
                    endpoint: event.endpoint.clone(),
                };
                announce(publisher.as_ref(), PRESENCE_ONLINE, &online).await;
            }

            if config.welcome && event.endpoint == config.channel {
                let greeting = Message::new(
                    direct_topic(&config.channel),
                    welcome_fragment(&event.user_id),
                )
                .with_recipient(event.user_id.as_str());
                if let Err(e) = publisher.publish(greeting).await {
                    if matches!(e, BusError::Closed) {
                        return Err(anyhow::Error::from(BusError::Cancelled));
                    }
                    warn!(user_id = %event.user_id, error = %e, "Welcome not sent");
                }
            }
            Ok::<(), anyhow::Error>(())
        }
    })
}

fn on_closed(tracker: Arc<PresenceTracker>, publisher: Arc<dyn Publisher>) -> Handler {
    handler_fn(move |message: Message| {
        let tracker = Arc::clone(&tracker);
        let publisher = Arc::clone(&publisher);
        async move {
            let event: ClientEvent = message.decode().map_err(anyhow::Error::from)?;
            if tracker.disconnect(&event.user_id) {
                info!(user_id = %event.user_id, endpoint = %event.endpoint, "User offline");
                let offline = PresenceEvent {
                    user_id: event.user_id,
                    endpoint: event.endpoint,
                };
                announce(publisher.as_ref(), PRESENCE_OFFLINE, &offline).await;
            }
            Ok::<(), anyhow::Error>(())
        }
    })
}

#[async_trait]
impl Module for PresenceModule {
    fn name(&self) -> &str {
        "presence"
    }

    async fn register(&self, registrar: &Registrar<'_>) -> anyhow::Result<()> {
        *self.config.lock() = registrar.module_config::<PresenceConfig>()?;
        registrar.provide(&TRACKER, Arc::clone(&self.tracker))?;
        Ok(())
    }

    async fn boot(&self, ctx: &mut BootContext) -> anyhow::Result<()> {
        let subscriber = ctx.registry().require(&SUBSCRIBER)?;
        let publisher = ctx.registry().require(&PUBLISHER)?;
        let config = self.config.lock().clone();

        let ready = subscriber.spawn(
            ctx.token(),
            CLIENT_READY,
            on_ready(Arc::clone(&self.tracker), Arc::clone(&publisher), config),
        )?;
        let closed = subscriber.spawn(
            ctx.token(),
            CLIENT_CLOSED,
            on_closed(Arc::clone(&self.tracker), publisher),
        )?;
        self.handles.lock().extend([ready, closed]);

        ctx.router().merge(
            Router::new()
                .route("/online", get(online))
                .with_state(Arc::clone(&self.tracker)),
        );
        debug!("Presence subscriptions installed");
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let topic = handle.topic().to_string();
            if let Err(e) = handle.stop(timeout).await {
                warn!(topic = %topic, error = %e, "Presence subscription did not stop cleanly");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::Orchestrator;
    use crate::pubsub::InMemoryBus;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    #[test]
    fn test_tracker_transitions() {
        let tracker = PresenceTracker::new();
        assert!(tracker.connect("alice"));
        assert!(!tracker.connect("alice"));
        assert_eq!(tracker.sessions("alice"), 2);

        assert!(!tracker.disconnect("alice"));
        assert!(tracker.disconnect("alice"));
        assert!(!tracker.is_online("alice"));
        assert!(tracker.online().is_empty());
    }

    #[test]
    fn test_tracker_tolerates_reordered_events() {
        let tracker = PresenceTracker::new();
        assert!(!tracker.disconnect("bob"));
        assert!(!tracker.is_online("bob"));
        assert!(!tracker.connect("bob"));
        assert!(!tracker.is_online("bob"));
        assert!(tracker.connect("bob"));
    }

    #[test]
    fn test_online_sorted() {
        let tracker = PresenceTracker::new();
        tracker.connect("carol");
        tracker.connect("alice");
        tracker.connect("alice");
        let online = tracker.online();
        assert_eq!(online.len(), 2);
        assert_eq!(online[0].user_id, "alice");
        assert_eq!(online[0].sessions, 2);
        assert_eq!(online[1].user_id, "carol");
    }

    #[test]
    fn test_welcome_escapes_user_id() {
        let fragment = welcome_fragment("<script>");
        assert!(fragment.contains("&lt;script&gt;"));
        assert!(!fragment.contains("<script>"));
    }

    fn collect(
        bus: &InMemoryBus,
        token: &CancellationToken,
        topic: &str,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.spawn(
            token,
            topic,
            handler_fn(move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .unwrap();
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn client_event(user_id: &str) -> ClientEvent {
        ClientEvent {
            endpoint: "html".to_string(),
            user_id: user_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_presence_lifecycle() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let mut online_rx = collect(&bus, &token, PRESENCE_ONLINE);
        let mut offline_rx = collect(&bus, &token, PRESENCE_OFFLINE);
        let mut direct_rx = collect(&bus, &token, "ws.html.direct");

        let orch = Orchestrator::builder(Arc::new(Config::default()))
            .bus(bus.clone())
            .module(PresenceModule::default())
            .build()
            .unwrap();
        let app = orch.start().await.unwrap();
        assert!(orch.registry().contains(&TRACKER));

        bus.publish(Message::json(CLIENT_READY, &client_event("alice")).unwrap())
            .await
            .unwrap();

        let online: PresenceEvent = next(&mut online_rx).await.decode().unwrap();
        assert_eq!(online.user_id, "alice");
        let welcome = next(&mut direct_rx).await;
        assert_eq!(welcome.recipient_id(), Some("alice"));
        assert!(welcome.text().unwrap().contains("Welcome, alice"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/app/presence/online")
                    .header("x-user-id", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let listing: OnlineResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(listing.count, 1);
        assert_eq!(listing.users[0].user_id, "alice");

        bus.publish(Message::json(CLIENT_CLOSED, &client_event("alice")).unwrap())
            .await
            .unwrap();
        let offline: PresenceEvent = next(&mut offline_rx).await.decode().unwrap();
        assert_eq!(offline.user_id, "alice");

        orch.shutdown(Duration::from_secs(2)).await;
        token.cancel();
    }
}
