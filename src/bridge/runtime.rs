//! Bridge runtime
//!
//! A [`Bridge`] ties one channel's hub to the bus: it subscribes to the
//! channel's broadcast and direct topics, relays their payloads through the
//! hub, and serves `/ws/<channel>` upgrades.

use axum::extract::ws::WebSocket;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::codec::Codec;
use super::config::BridgeConfig;
use super::connection;
use super::error::{BridgeError, BridgeResult};
use super::handler;
use super::hub::{Hub, HubLoop, HubStats};
use crate::pubsub::{
    handler_fn, Handler, Message, Publisher, Subscriber, Subscription, SubscriptionHandle,
};
use crate::topics::framework::{broadcast_topic, direct_topic};
use crate::topics::TopicManager;

static CHANNEL_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*$").unwrap());

/// State every connection task reads
pub(crate) struct Shared {
    pub config: BridgeConfig,
    pub codec: Codec,
    pub hub: Hub,
    pub publisher: Arc<dyn Publisher>,
    pub topics: Arc<TopicManager>,
}

#[derive(Default)]
struct State {
    started: bool,
    stopped: bool,
    hub_loop: Option<HubLoop>,
    hub_task: Option<JoinHandle<()>>,
    subscriptions: Vec<SubscriptionHandle>,
}

struct Inner {
    shared: Arc<Shared>,
    subscriber: Arc<dyn Subscriber>,
    state: Mutex<State>,
    accepting: AtomicBool,
    /// Stops the hub loop and every connection task
    shutdown: CancellationToken,
    connections: TaskTracker,
}

/// WebSocket bridge for one channel
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        publisher: Arc<dyn Publisher>,
        subscriber: Arc<dyn Subscriber>,
        topics: Arc<TopicManager>,
    ) -> BridgeResult<Self> {
        if !CHANNEL_NAME.is_match(&config.channel) {
            return Err(BridgeError::InvalidChannel(config.channel));
        }

        let (hub, hub_loop) = Hub::new(&config.channel, config.max_connections);
        let codec = Codec::for_channel(&config.channel);
        Ok(Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    config,
                    codec,
                    hub,
                    publisher,
                    topics,
                }),
                subscriber,
                state: Mutex::new(State {
                    hub_loop: Some(hub_loop),
                    ..State::default()
                }),
                accepting: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                connections: TaskTracker::new(),
            }),
        })
    }

    pub fn channel(&self) -> &str {
        &self.inner.shared.config.channel
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.shared.config
    }

    pub fn broadcast_topic(&self) -> String {
        broadcast_topic(self.channel())
    }

    pub fn direct_topic(&self) -> String {
        direct_topic(self.channel())
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Start the hub and subscribe to the channel's topics
    ///
    /// Idempotent. If either subscription cannot be installed, neither is
    /// left behind and the hub is not started. Cancelling `cancel` stops the
    /// subscriptions.
    pub fn start(&self, cancel: &CancellationToken) -> BridgeResult<()> {
        let mut state = self.inner.state.lock();
        if state.started {
            return Ok(());
        }
        if state.stopped {
            return Err(BridgeError::ShuttingDown);
        }

        let token = cancel.child_token();
        let broadcast = self.open(&token, self.broadcast_topic(), self.broadcast_handler())?;
        let direct = match self.open(&token, self.direct_topic(), self.direct_handler()) {
            Ok(direct) => direct,
            Err(err) => {
                drop(broadcast);
                return Err(err);
            }
        };
        let Some(hub_loop) = state.hub_loop.take() else {
            return Err(BridgeError::HubClosed);
        };

        state.hub_task = Some(tokio::spawn(hub_loop.run(self.inner.shutdown.clone())));
        state.subscriptions = vec![
            SubscriptionHandle::spawn(broadcast),
            SubscriptionHandle::spawn(direct),
        ];
        state.started = true;
        self.inner.accepting.store(true, Ordering::Release);

        info!(
            channel = %self.channel(),
            broadcast = %self.broadcast_topic(),
            direct = %self.direct_topic(),
            "Bridge started"
        );
        Ok(())
    }

    fn open(
        &self,
        token: &CancellationToken,
        topic: String,
        handler: Handler,
    ) -> BridgeResult<Subscription> {
        self.inner
            .subscriber
            .open(token, &topic, handler)
            .map_err(|source| BridgeError::Subscribe { topic, source })
    }

    fn broadcast_handler(&self) -> Handler {
        let hub = self.inner.shared.hub.clone();
        handler_fn(move |message: Message| {
            let hub = hub.clone();
            async move { hub.broadcast(message.payload).await.map_err(anyhow::Error::from) }
        })
    }

    fn direct_handler(&self) -> Handler {
        let hub = self.inner.shared.hub.clone();
        handler_fn(move |message: Message| {
            let hub = hub.clone();
            async move {
                let user_id = match message.recipient_id() {
                    Some(user_id) => user_id.to_string(),
                    None => {
                        warn!(topic = %message.topic, "Direct message without recipient_id dropped");
                        return Ok(());
                    }
                };
                hub.direct(&user_id, message.payload)
                    .await
                    .map_err(anyhow::Error::from)
            }
        })
    }

    /// Stop the bridge within `timeout`
    ///
    /// Stops accepting upgrades, cancels both subscriptions, stops the hub
    /// (closing every client queue) and waits for connection tasks. Tasks
    /// still running at the deadline are abandoned with a warning.
    /// Idempotent.
    pub async fn shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let (subscriptions, hub_task) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            (std::mem::take(&mut state.subscriptions), state.hub_task.take())
        };
        self.inner.accepting.store(false, Ordering::Release);
        info!(channel = %self.channel(), "Shutting down bridge");

        for subscription in subscriptions {
            let topic = subscription.topic().to_string();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(err) = subscription.stop(remaining).await {
                warn!(channel = %self.channel(), topic = %topic, error = %err, "Bridge subscription ended with error");
            }
        }

        self.inner.shutdown.cancel();
        self.inner.connections.close();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, self.inner.connections.wait())
            .await
            .is_err()
        {
            warn!(
                channel = %self.channel(),
                abandoned = self.inner.connections.len(),
                "Connections still open at shutdown deadline, abandoning"
            );
        }

        if let Some(task) = hub_task {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!(channel = %self.channel(), "Hub event loop did not stop in time");
            }
        }
        info!(channel = %self.channel(), "Bridge stopped");
    }

    /// Send `payload` to every client without going through the bus
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> BridgeResult<()> {
        self.inner.shared.hub.broadcast(payload.into()).await
    }

    pub async fn stats(&self) -> BridgeResult<HubStats> {
        self.inner.shared.hub.stats().await
    }

    pub async fn connections_for(&self, user_id: &str) -> BridgeResult<usize> {
        self.inner.shared.hub.connections_for(user_id).await
    }

    /// Connection tasks still running, registered or not
    pub fn active_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// `GET /ws/<channel>`; expects an authentication layer in front
    pub fn routes(&self) -> Router {
        Router::new()
            .route(&format!("/ws/{}", self.channel()), get(handler::upgrade))
            .with_state(self.clone())
    }

    /// Hand an upgraded socket to a new connection task
    pub(crate) fn accept(&self, socket: WebSocket, user_id: String) {
        if !self.is_accepting() {
            debug!(channel = %self.channel(), user_id = %user_id, "Upgrade after shutdown, socket dropped");
            return;
        }
        let shared = Arc::clone(&self.inner.shared);
        let shutdown = self.inner.shutdown.clone();
        self.inner
            .connections
            .spawn(connection::serve(socket, user_id, shared, shutdown));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ClientEvent;
    use crate::pubsub::{BusConfig, InMemoryBus};
    use crate::server::auth::{authenticate, Authenticator, HeaderAuthenticator};
    use crate::topics::framework::{register_framework_topics, CLIENT_CLOSED, CLIENT_READY};
    use crate::topics::{define_module, TopicConfig};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as ClientFrame;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        bus: InMemoryBus,
        topics: Arc<TopicManager>,
        token: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let topics = Arc::new(TopicManager::new());
            register_framework_topics(&topics, &["html", "data"]).unwrap();
            Self {
                bus: InMemoryBus::new(BusConfig::default()),
                topics,
                token: CancellationToken::new(),
            }
        }

        fn bridge(&self, config: BridgeConfig) -> Bridge {
            let bus = Arc::new(self.bus.clone());
            let bridge = Bridge::new(config, bus.clone(), bus, Arc::clone(&self.topics)).unwrap();
            bridge.start(&self.token).unwrap();
            bridge
        }
    }

    async fn serve(bridge: &Bridge) -> SocketAddr {
        let auth: Arc<dyn Authenticator> = Arc::new(HeaderAuthenticator);
        let app = bridge
            .routes()
            .layer(axum::middleware::from_fn_with_state(auth, authenticate));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, channel: &str, user: &str) -> Client {
        let url = format!("ws://{addr}/ws/{channel}?user={user}");
        let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
    }

    async fn wait_for_connections(bridge: &Bridge, expected: usize) {
        for _ in 0..200 {
            if bridge.stats().await.unwrap().connections == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("bridge never reached {expected} connections");
    }

    /// Next text frame, skipping keepalives
    async fn next_text(client: &mut Client, wait: Duration) -> Option<String> {
        let deadline = Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
            match frame.ok()? {
                ClientFrame::Text(text) => return Some(text),
                ClientFrame::Ping(_) | ClientFrame::Pong(_) => continue,
                _ => return None,
            }
        }
    }

    #[test]
    fn test_rejects_bad_channel_name() {
        let bus = Arc::new(InMemoryBus::default());
        let err = Bridge::new(
            BridgeConfig::new("Html-1"),
            bus.clone(),
            bus,
            Arc::new(TopicManager::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BridgeError::InvalidChannel(_)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let harness = Harness::new();
        let bridge = harness.bridge(BridgeConfig::new("html"));
        bridge.start(&harness.token).unwrap();
        assert_eq!(harness.bus.subscriber_count("ws.html.broadcast"), 1);
        assert_eq!(harness.bus.subscriber_count("ws.html.direct"), 1);
        bridge.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_start_unwinds_subscriptions() {
        let harness = Harness::new();
        harness.bus.close().await;
        let bus = Arc::new(harness.bus.clone());
        let bridge = Bridge::new(BridgeConfig::new("html"), bus.clone(), bus, harness.topics).unwrap();

        let err = bridge.start(&harness.token).unwrap_err();
        assert!(matches!(err, BridgeError::Subscribe { .. }));
        assert!(!bridge.is_accepting());
        assert_eq!(harness.bus.stats().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let harness = Harness::new();
        let bridge = harness.bridge(BridgeConfig::new("html"));
        let addr = serve(&bridge).await;

        let mut c1 = connect(addr, "html", "u1").await;
        let mut c2 = connect(addr, "html", "u2").await;
        wait_for_connections(&bridge, 2).await;

        harness
            .bus
            .publish(Message::new("ws.html.broadcast", "<div>hi</div>"))
            .await
            .unwrap();

        let wait = Duration::from_secs(2);
        assert_eq!(next_text(&mut c1, wait).await.as_deref(), Some("<div>hi</div>"));
        assert_eq!(next_text(&mut c2, wait).await.as_deref(), Some("<div>hi</div>"));

        bridge.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_direct_reaches_only_recipient() {
        let harness = Harness::new();
        let bridge = harness.bridge(BridgeConfig::new("html"));
        let addr = serve(&bridge).await;

        let mut a = connect(addr, "html", "u1").await;
        let mut b = connect(addr, "html", "u1").await;
        let mut other = connect(addr, "html", "u2").await;
        wait_for_connections(&bridge, 3).await;
        assert_eq!(bridge.connections_for("u1").await.unwrap(), 2);

        harness
            .bus
            .publish(Message::new("ws.html.direct", "X").with_recipient("u1"))
            .await
            .unwrap();
        harness
            .bus
            .publish(Message::new("ws.html.direct", "no recipient"))
            .await
            .unwrap();

        let wait = Duration::from_secs(2);
        assert_eq!(next_text(&mut a, wait).await.as_deref(), Some("X"));
        assert_eq!(next_text(&mut b, wait).await.as_deref(), Some("X"));
        assert_eq!(next_text(&mut other, Duration::from_millis(200)).await, None);

        bridge.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_client_ready_event() {
        let harness = Harness::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ready = harness
            .bus
            .spawn(
                &harness.token,
                CLIENT_READY,
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message.decode::<ClientEvent>()?);
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .unwrap();

        let bridge = harness.bridge(BridgeConfig::new("data"));
        let addr = serve(&bridge).await;
        let _alice = connect(addr, "data", "alice").await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ClientEvent {
                endpoint: "data".into(),
                user_id: "alice".into()
            }
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());

        bridge.shutdown(Duration::from_secs(2)).await;
    }

    fn closed_events(harness: &Harness) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        harness
            .bus
            .spawn(
                &harness.token,
                CLIENT_CLOSED,
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message.decode::<ClientEvent>()?);
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_client_closed_event_on_disconnect() {
        let harness = Harness::new();
        let mut rx = closed_events(&harness);

        let bridge = harness.bridge(BridgeConfig::new("html"));
        let addr = serve(&bridge).await;
        let mut bob = connect(addr, "html", "bob").await;
        wait_for_connections(&bridge, 1).await;

        bob.close(None).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ClientEvent {
                endpoint: "html".into(),
                user_id: "bob".into()
            }
        );
        wait_for_connections(&bridge, 0).await;

        bridge.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_silent_client_dropped_after_pong_timeout() {
        let harness = Harness::new();
        let mut rx = closed_events(&harness);

        let config = BridgeConfig::new("data")
            .keepalive(Duration::from_secs(30), Duration::from_millis(200));
        let bridge = harness.bridge(config);
        let addr = serve(&bridge).await;

        // Held open but never read from or written to
        let _alice = connect(addr, "data", "alice").await;
        wait_for_connections(&bridge, 1).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ClientEvent {
                endpoint: "data".into(),
                user_id: "alice".into()
            }
        );
        wait_for_connections(&bridge, 0).await;
        assert_eq!(bridge.connections_for("alice").await.unwrap(), 0);

        bridge.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_inbound_frames_are_republished() {
        let harness = Harness::new();
        harness
            .topics
            .register(define_module(
                TopicConfig::new("chat.messages", "Chat lines").module("chat"),
            ))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _chat = harness
            .bus
            .spawn(
                &harness.token,
                "chat.messages",
                handler_fn(move |message: Message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            )
            .unwrap();

        let bridge = harness.bridge(BridgeConfig::new("html"));
        let addr = serve(&bridge).await;
        let mut client = connect(addr, "html", "u1").await;
        wait_for_connections(&bridge, 1).await;

        // Malformed, unregistered and framework targets are dropped
        for frame in [
            "not json",
            r#"{"action":"chat.unknown"}"#,
            r#"{"action":"ws.html.broadcast"}"#,
            r#"{"action":"chat.messages","body":"hello"}"#,
        ] {
            client.send(ClientFrame::Text(frame.into())).await.unwrap();
        }

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.get_meta("user_id"), Some("u1"));
        assert_eq!(message.get_meta("endpoint"), Some("html"));
        assert!(message.get_meta("connection_id").is_some());
        assert_eq!(message.text(), Some(r#"{"body":"hello"}"#));
        assert_eq!(bridge.stats().await.unwrap().connections, 1);

        bridge.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_unauthenticated_upgrade_rejected() {
        let harness = Harness::new();
        let bridge = harness.bridge(BridgeConfig::new("html"));
        let addr = serve(&bridge).await;

        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/html")).await;
        assert!(result.is_err());
        bridge.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_with_slow_client() {
        let harness = Harness::new();
        let bridge = harness.bridge(
            BridgeConfig::new("html")
                .outbound_capacity(16)
                .write_timeout(Duration::from_millis(500)),
        );
        let addr = serve(&bridge).await;

        // Never reads
        let _slow = connect(addr, "html", "slow").await;
        wait_for_connections(&bridge, 1).await;

        let payload = Bytes::from(vec![b'x'; 8 * 1024]);
        for _ in 0..10_000 {
            harness
                .bus
                .publish(Message::new("ws.html.broadcast", payload.clone()))
                .await
                .unwrap();
        }
        wait_for_connections(&bridge, 0).await;

        let started = Instant::now();
        bridge.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(bridge.active_connections(), 0);
        assert_eq!(harness.bus.subscriber_count("ws.html.broadcast"), 0);
        assert!(matches!(bridge.stats().await, Err(BridgeError::HubClosed)));

        // A second shutdown is a no-op
        bridge.shutdown(Duration::from_secs(2)).await;
    }
}
