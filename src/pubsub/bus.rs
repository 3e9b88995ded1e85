//! In-memory bus
//!
//! Every subscription owns a bounded queue drained by its own task on the
//! bus's `TaskTracker`. Publishing fans a message out to the queues of the
//! topic's current subscribers, applying the configured
//! [`BackpressurePolicy`] when a queue is full.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::error::{BusError, BusResult};
use super::message::Message;
use super::policy::{BackpressurePolicy, BusConfig};
use super::queue::{CloseReason, Offer, SubscriptionQueue};
use super::subscription::Subscription;
use super::{Handler, Publisher, Subscriber};

/// Snapshot of bus counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub handler_errors: u64,
    pub active_subscriptions: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub evicted: AtomicU64,
    pub handler_errors: AtomicU64,
    pub active: AtomicU64,
}

pub(crate) struct Slot {
    pub id: u64,
    pub queue: Arc<SubscriptionQueue>,
}

pub(crate) struct BusInner {
    pub config: BusConfig,
    topics: RwLock<HashMap<String, Vec<Slot>>>,
    closed: AtomicBool,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    next_id: AtomicU64,
    pub counters: Counters,
}

impl BusInner {
    /// Remove a subscription's queue from its topic
    pub fn detach(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(slots) = topics.get_mut(topic) {
            if let Some(pos) = slots.iter().position(|s| s.id == id) {
                let slot = slots.swap_remove(pos);
                slot.queue.close(CloseReason::Unsubscribed);
            }
            if slots.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn evict(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(slots) = topics.get_mut(topic) {
            if let Some(pos) = slots.iter().position(|s| s.id == id) {
                let slot = slots.swap_remove(pos);
                slot.queue.close(CloseReason::Evicted);
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            }
            if slots.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn note_drop(&self, topic: &str, id: u64, queue: &SubscriptionQueue) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        let total = queue.record_drop();
        // Log the first drop and every thousandth after it
        if total == 1 || total % 1000 == 0 {
            warn!(
                topic = %topic,
                subscription_id = id,
                dropped = total,
                policy = self.config.policy.name(),
                "Subscriber queue full, message dropped"
            );
        }
    }
}

/// In-process publisher and subscriber
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    pub fn new(config: BusConfig) -> Self {
        info!(
            queue_capacity = config.queue_capacity,
            policy = config.policy.name(),
            "Creating in-memory bus"
        );
        Self {
            inner: Arc::new(BusInner {
                config,
                topics: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            active_subscriptions: c.active.load(Ordering::Relaxed),
        }
    }

    /// Close the bus
    ///
    /// Rejects further publishes and subscriptions, ends every subscription
    /// with [`StopReason::BusClosed`](super::StopReason::BusClosed) and waits
    /// up to the handler grace window for in-flight handlers. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing bus");

        self.inner.shutdown.cancel();
        let drained: Vec<Slot> = {
            let mut topics = self.inner.topics.write();
            topics.drain().flat_map(|(_, slots)| slots).collect()
        };
        for slot in &drained {
            slot.queue.close(CloseReason::BusClosed);
        }

        self.inner.tracker.close();
        let grace = self.inner.config.handler_grace;
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.inner.tracker.len(),
                "Bus closed with handlers still running past the grace window"
            );
        }
    }

    /// Fan a message out to the topic's current subscribers
    ///
    /// Under [`BackpressurePolicy::BlockBounded`] the whole fan-out shares a
    /// single deadline, so a publish blocks at most one bound however many
    /// subscribers are full. Once interrupted, the remaining subscribers only
    /// get a non-blocking offer and the interruption is returned.
    async fn fan_out(
        &self,
        cancel: Option<&CancellationToken>,
        message: Message,
    ) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<(u64, Arc<SubscriptionQueue>)> = {
            let topics = self.inner.topics.read();
            match topics.get(&message.topic) {
                Some(slots) => slots.iter().map(|s| (s.id, Arc::clone(&s.queue))).collect(),
                None => return Ok(()),
            }
        };

        let mut deadline = match self.inner.config.policy {
            BackpressurePolicy::BlockBounded(wait) => Instant::now() + wait,
            _ => Instant::now(),
        };
        let mut outcome = Ok(());
        let topic = message.topic.clone();
        let last = targets.len().saturating_sub(1);
        let mut message = Some(message);
        for (i, (id, queue)) in targets.iter().enumerate() {
            let next = if i == last {
                message.take()
            } else {
                message.clone()
            };
            let Some(next) = next else {
                continue;
            };
            if let Err(err) = self.offer(&topic, *id, queue, next, deadline, cancel).await {
                if outcome.is_ok() {
                    debug!(topic = %topic, error = %err, "Publish interrupted while blocked");
                    outcome = Err(err);
                    deadline = Instant::now();
                }
            }
        }
        outcome
    }

    async fn offer(
        &self,
        topic: &str,
        id: u64,
        queue: &SubscriptionQueue,
        message: Message,
        deadline: Instant,
        cancel: Option<&CancellationToken>,
    ) -> BusResult<()> {
        match self.inner.config.policy {
            BackpressurePolicy::BlockBounded(_) => {
                let message = match queue.try_push(message) {
                    Offer::Full(message) => message,
                    _ => return Ok(()),
                };
                let offer = tokio::select! {
                    biased;
                    offer = queue.push_until(message, deadline) => offer,
                    err = interrupted(cancel, &self.inner.shutdown) => {
                        self.inner.note_drop(topic, id, queue);
                        return Err(err);
                    }
                };
                if let Offer::Full(_) = offer {
                    self.inner.note_drop(topic, id, queue);
                }
            }
            BackpressurePolicy::DropOldest => {
                if let Ok(Some(_)) = queue.push_displacing(message) {
                    self.inner.note_drop(topic, id, queue);
                }
            }
            BackpressurePolicy::EvictSubscriber => {
                if let Offer::Full(_) = queue.try_push(message) {
                    warn!(
                        topic = %topic,
                        subscription_id = id,
                        "Subscriber queue full, evicting subscription"
                    );
                    self.inner.evict(topic, id);
                }
            }
        }
        Ok(())
    }
}

/// Resolves when the publisher's token or the bus shutdown fires
async fn interrupted(
    cancel: Option<&CancellationToken>,
    shutdown: &CancellationToken,
) -> BusError {
    match cancel {
        Some(cancel) => tokio::select! {
            _ = cancel.cancelled() => BusError::Cancelled,
            _ = shutdown.cancelled() => BusError::Closed,
        },
        None => {
            shutdown.cancelled().await;
            BusError::Closed
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, message: Message) -> BusResult<()> {
        self.fan_out(None, message).await
    }

    async fn publish_with(&self, cancel: &CancellationToken, message: Message) -> BusResult<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        self.fan_out(Some(cancel), message).await
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    fn open(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        handler: Handler,
    ) -> BusResult<Subscription> {
        let queue = Arc::new(SubscriptionQueue::new(self.inner.config.queue_capacity));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.inner.topics.write();
            if self.is_closed() {
                return Err(BusError::Closed);
            }
            topics.entry(topic.to_string()).or_default().push(Slot {
                id,
                queue: Arc::clone(&queue),
            });
        }
        debug!(topic = %topic, subscription_id = id, "Subscription opened");

        Ok(Subscription::new(
            id,
            topic.to_string(),
            queue,
            handler,
            cancel.child_token(),
            Arc::clone(&self.inner),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{handler_fn, StopReason};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    fn bus(capacity: usize, policy: BackpressurePolicy) -> InMemoryBus {
        InMemoryBus::new(
            BusConfig::default()
                .queue_capacity(capacity)
                .policy(policy)
                .handler_grace(Duration::from_millis(200)),
        )
    }

    /// Handler forwarding payload text to a channel
    fn forwarding() -> (Handler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.text().unwrap_or_default().to_string());
                Ok(())
            }
        });
        (handler, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryBus::default();
        bus.publish(Message::new("chat.messages", "hi")).await.unwrap();
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test]
    async fn test_fifo_per_publisher() {
        let bus = bus(256, BackpressurePolicy::BlockBounded(Duration::from_secs(1)));
        let token = CancellationToken::new();
        let (handler, mut rx) = forwarding();
        let handle = bus.spawn(&token, "chat.messages", handler).unwrap();

        for n in 0..100 {
            bus.publish(Message::new("chat.messages", n.to_string()))
                .await
                .unwrap();
        }
        for n in 0..100 {
            assert_eq!(recv(&mut rx).await, n.to_string());
        }

        token.cancel();
        let reason = handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let (h1, mut rx1) = forwarding();
        let (h2, mut rx2) = forwarding();
        let _a = bus.spawn(&token, "chat.messages", h1).unwrap();
        let _b = bus.spawn(&token, "chat.messages", h2).unwrap();
        assert_eq!(bus.subscriber_count("chat.messages"), 2);

        bus.publish(Message::new("chat.messages", "hello")).await.unwrap();
        assert_eq!(recv(&mut rx1).await, "hello");
        assert_eq!(recv(&mut rx2).await, "hello");
        token.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_returns_on_cancel() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let (handler, _rx) = forwarding();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let reason = bus.subscribe(&token, "chat.messages", handler).await.unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(bus.subscriber_count("chat.messages"), 0);
        assert_eq!(bus.stats().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_subscription() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |msg: Message| {
            let tx = tx.clone();
            async move {
                if msg.text() == Some("bad") {
                    anyhow::bail!("rejected");
                }
                let _ = tx.send(msg.text().unwrap_or_default().to_string());
                Ok(())
            }
        });
        let handle = bus.spawn(&token, "orders.created", handler).unwrap();

        bus.publish(Message::new("orders.created", "bad")).await.unwrap();
        bus.publish(Message::new("orders.created", "good")).await.unwrap();
        assert_eq!(recv(&mut rx).await, "good");
        assert_eq!(bus.stats().handler_errors, 1);
        assert!(!handle.is_finished());
        token.cancel();
    }

    #[tokio::test]
    async fn test_handler_cancellation_sentinel_stops_cleanly() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let handler = handler_fn(|_msg: Message| async {
            Err::<(), _>(anyhow::Error::from(BusError::Cancelled))
        });
        let handle = bus.spawn(&token, "jobs.done", handler).unwrap();

        bus.publish(Message::new("jobs.done", "x")).await.unwrap();
        let reason = handle.join().await.unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_handler_panic_is_recovered() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let handler = handler_fn(|msg: Message| async move {
            if msg.text().is_some() {
                panic!("handler bug");
            }
            Ok::<(), anyhow::Error>(())
        });
        let handle = bus.spawn(&token, "jobs.done", handler).unwrap();

        bus.publish(Message::new("jobs.done", "x")).await.unwrap();
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, BusError::HandlerPanicked { .. }));

        // The bus keeps working for everyone else
        let (handler, mut rx) = forwarding();
        let _other = bus.spawn(&token, "jobs.done", handler).unwrap();
        bus.publish(Message::new("jobs.done", "after")).await.unwrap();
        assert_eq!(recv(&mut rx).await, "after");
        token.cancel();
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let (handler, _rx) = forwarding();
        let handle = bus.spawn(&token, "chat.messages", handler).unwrap();

        bus.close().await;
        bus.close().await;

        assert_eq!(
            handle.stop(Duration::from_secs(1)).await.unwrap(),
            StopReason::BusClosed
        );
        assert_eq!(
            bus.publish(Message::new("chat.messages", "late")).await,
            Err(BusError::Closed)
        );
        let (handler, _rx) = forwarding();
        assert!(matches!(
            bus.open(&token, "chat.messages", handler),
            Err(BusError::Closed)
        ));
    }

    /// Handler that blocks until a permit is released, recording payloads
    fn gated() -> (Handler, Arc<Semaphore>, Arc<Mutex<Vec<String>>>) {
        let gate = Arc::new(Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (g, s) = (Arc::clone(&gate), Arc::clone(&seen));
        let handler = handler_fn(move |msg: Message| {
            let (gate, seen) = (Arc::clone(&g), Arc::clone(&s));
            async move {
                gate.acquire().await?.forget();
                seen.lock().push(msg.text().unwrap_or_default().to_string());
                Ok::<(), anyhow::Error>(())
            }
        });
        (handler, gate, seen)
    }

    async fn wait_for(seen: &Mutex<Vec<String>>, len: usize) {
        for _ in 0..200 {
            if seen.lock().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} of {len} messages handled", seen.lock().len());
    }

    #[tokio::test]
    async fn test_block_bounded_drops_after_wait() {
        let bus = bus(2, BackpressurePolicy::BlockBounded(Duration::from_millis(10)));
        let token = CancellationToken::new();
        let (handler, gate, seen) = gated();
        let _handle = bus.spawn(&token, "metrics.sample", handler).unwrap();

        // First message is taken by the (blocked) handler, two fill the queue
        for n in 0..6 {
            bus.publish(Message::new("metrics.sample", n.to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(bus.stats().dropped >= 1);

        gate.add_permits(10);
        wait_for(&seen, 3).await;
        let seen = seen.lock().clone();
        assert_eq!(&seen[..1], &["0".to_string()]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let bus = bus(2, BackpressurePolicy::DropOldest);
        let token = CancellationToken::new();
        let (handler, gate, seen) = gated();
        let _handle = bus.spawn(&token, "metrics.sample", handler).unwrap();

        bus.publish(Message::new("metrics.sample", "0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for n in 1..6 {
            bus.publish(Message::new("metrics.sample", n.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(bus.stats().dropped, 3);

        gate.add_permits(10);
        wait_for(&seen, 3).await;
        assert_eq!(*seen.lock(), vec!["0", "4", "5"]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_evict_subscriber_on_overflow() {
        let bus = bus(1, BackpressurePolicy::EvictSubscriber);
        let token = CancellationToken::new();
        let (handler, gate, _seen) = gated();
        let handle = bus.spawn(&token, "metrics.sample", handler).unwrap();

        bus.publish(Message::new("metrics.sample", "0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Message::new("metrics.sample", "1")).await.unwrap();
        bus.publish(Message::new("metrics.sample", "2")).await.unwrap();

        gate.add_permits(10);
        let err = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BusError::Evicted { .. }));
        assert_eq!(bus.subscriber_count("metrics.sample"), 0);
        assert_eq!(bus.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_block_bounded_wait_is_shared_across_subscribers() {
        let wait = Duration::from_millis(50);
        let bus = bus(1, BackpressurePolicy::BlockBounded(wait));
        let token = CancellationToken::new();
        let mut gates = Vec::new();
        for _ in 0..5 {
            let (handler, gate, _seen) = gated();
            bus.spawn(&token, "metrics.sample", handler).unwrap();
            gates.push(gate);
        }

        // Every handler holds "0" and every queue holds "1"
        bus.publish(Message::new("metrics.sample", "0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Message::new("metrics.sample", "1")).await.unwrap();
        assert_eq!(bus.stats().dropped, 0);

        let started = Instant::now();
        bus.publish(Message::new("metrics.sample", "2")).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= wait, "returned before the bound: {elapsed:?}");
        assert!(
            elapsed < wait * 3,
            "blocked {elapsed:?} with five full subscribers"
        );
        assert_eq!(bus.stats().dropped, 5);
        for gate in gates {
            gate.add_permits(10);
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_publish_with_cancelled_token_stops_blocking() {
        let bus = bus(1, BackpressurePolicy::BlockBounded(Duration::from_secs(5)));
        let token = CancellationToken::new();
        let (handler, gate, _seen) = gated();
        let _handle = bus.spawn(&token, "metrics.sample", handler).unwrap();

        bus.publish(Message::new("metrics.sample", "0")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Message::new("metrics.sample", "1")).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = bus
            .publish_with(&cancel, Message::new("metrics.sample", "2"))
            .await;
        assert_eq!(result, Err(BusError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(bus.stats().dropped, 1);

        // Already cancelled: nothing is published
        let published = bus.stats().published;
        assert_eq!(
            bus.publish_with(&cancel, Message::new("metrics.sample", "3"))
                .await,
            Err(BusError::Cancelled)
        );
        assert_eq!(bus.stats().published, published);

        gate.add_permits(10);
        token.cancel();
    }

    #[tokio::test]
    async fn test_publish_with_live_token_delivers() {
        let bus = InMemoryBus::default();
        let token = CancellationToken::new();
        let (handler, mut rx) = forwarding();
        let _handle = bus.spawn(&token, "chat.messages", handler).unwrap();

        let cancel = CancellationToken::new();
        bus.publish_with(&cancel, Message::new("chat.messages", "hi"))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, "hi");
        token.cancel();
    }

    /// Handler that reports when it starts, then sleeps far past any grace
    fn sleeper() -> (Handler, Arc<AtomicBool>, mpsc::UnboundedReceiver<()>) {
        let finished = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = Arc::clone(&finished);
        let handler = handler_fn(move |_msg: Message| {
            let (flag, tx) = (Arc::clone(&flag), tx.clone());
            async move {
                let _ = tx.send(());
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        });
        (handler, finished, rx)
    }

    #[tokio::test]
    async fn test_cancel_abandons_running_handler_after_grace() {
        let bus = bus(8, BackpressurePolicy::DropOldest);
        let token = CancellationToken::new();
        let (handler, finished, mut started) = sleeper();
        let handle = bus.spawn(&token, "jobs.run", handler).unwrap();

        bus.publish(Message::new("jobs.run", "x")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), started.recv())
            .await
            .unwrap();

        let begun = Instant::now();
        token.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert!(begun.elapsed() >= Duration::from_millis(200));
        assert!(begun.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(bus.stats().delivered, 0);
    }

    #[tokio::test]
    async fn test_close_abandons_running_handler_after_grace() {
        let bus = bus(8, BackpressurePolicy::DropOldest);
        let token = CancellationToken::new();
        let (handler, finished, mut started) = sleeper();
        let handle = bus.spawn(&token, "jobs.run", handler).unwrap();

        bus.publish(Message::new("jobs.run", "x")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), started.recv())
            .await
            .unwrap();

        let begun = Instant::now();
        bus.close().await;
        assert!(begun.elapsed() < Duration::from_secs(1));
        let reason = tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::BusClosed);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
