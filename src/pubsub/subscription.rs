//! Subscription delivery

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::bus::BusInner;
use super::error::{BusError, BusResult, StopReason};
use super::queue::{CloseReason, SubscriptionQueue};
use super::Handler;

/// Keeps a queue attached to its topic; detaches on drop
struct Attachment {
    bus: Arc<BusInner>,
    topic: String,
    id: u64,
}

impl Attachment {
    fn new(bus: Arc<BusInner>, topic: String, id: u64) -> Self {
        bus.counters.active.fetch_add(1, Ordering::Relaxed);
        Self { bus, topic, id }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.bus.detach(&self.topic, self.id);
        self.bus.counters.active.fetch_sub(1, Ordering::Relaxed);
        debug!(topic = %self.topic, subscription_id = self.id, "Subscription detached");
    }
}

/// An installed subscription that has not started delivering yet
///
/// Messages published after [`Subscriber::open`](super::Subscriber::open)
/// returns are queued for it. Dropping it without running detaches it.
pub struct Subscription {
    id: u64,
    topic: String,
    queue: Arc<SubscriptionQueue>,
    handler: Handler,
    cancel: CancellationToken,
    attachment: Attachment,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        topic: String,
        queue: Arc<SubscriptionQueue>,
        handler: Handler,
        cancel: CancellationToken,
        bus: Arc<BusInner>,
    ) -> Self {
        let attachment = Attachment::new(bus, topic.clone(), id);
        Self {
            id,
            topic,
            queue,
            handler,
            cancel,
            attachment,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Token that stops only this subscription
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Deliver messages until cancelled, closed or evicted
    ///
    /// Delivery runs on its own task; a handler panic ends the subscription
    /// with [`BusError::HandlerPanicked`] and leaves the bus usable. Dropping
    /// the returned future cancels the subscription.
    pub async fn run(self) -> BusResult<StopReason> {
        let bus = Arc::clone(&self.attachment.bus);
        let topic = self.topic.clone();
        let guard = self.cancel.clone().drop_guard();

        let result = match bus.tracker.spawn(deliver(self)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                error!(topic = %topic, "Handler panicked, subscription stopped");
                Err(BusError::HandlerPanicked { topic })
            }
            Err(_) => Ok(StopReason::BusClosed),
        };
        guard.disarm();
        result
    }
}

async fn stopped(cancel: &CancellationToken, shutdown: &CancellationToken) -> StopReason {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => StopReason::Cancelled,
        _ = shutdown.cancelled() => StopReason::BusClosed,
    }
}

/// Eviction outranks whatever stopped the loop
fn finish(queue: &SubscriptionQueue, topic: &str, reason: StopReason) -> BusResult<StopReason> {
    match queue.close_reason() {
        Some(CloseReason::Evicted) => Err(BusError::Evicted {
            topic: topic.to_string(),
        }),
        Some(CloseReason::BusClosed) => Ok(StopReason::BusClosed),
        _ => Ok(reason),
    }
}

async fn deliver(sub: Subscription) -> BusResult<StopReason> {
    let Subscription {
        id,
        topic,
        queue,
        handler,
        cancel,
        attachment,
    } = sub;
    let shutdown = attachment.bus.shutdown.clone();
    let grace = attachment.bus.config.handler_grace;
    let counters = &attachment.bus.counters;

    loop {
        let message = tokio::select! {
            biased;
            reason = stopped(&cancel, &shutdown) => return finish(&queue, &topic, reason),
            next = queue.pop() => match next {
                Some(message) => message,
                None => return finish(&queue, &topic, StopReason::Cancelled),
            },
        };

        let mut handled = handler(message);
        let outcome = tokio::select! {
            biased;
            outcome = &mut handled => outcome,
            reason = stopped(&cancel, &shutdown) => {
                if tokio::time::timeout(grace, &mut handled).await.is_err() {
                    warn!(
                        topic = %topic,
                        subscription_id = id,
                        grace_ms = grace.as_millis() as u64,
                        "Handler still running after grace window, abandoning it"
                    );
                }
                return finish(&queue, &topic, reason);
            }
        };

        match outcome {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if BusError::is_cancellation(&err) => {
                debug!(topic = %topic, subscription_id = id, "Handler ended its subscription");
                return Ok(StopReason::Cancelled);
            }
            Err(err) => {
                counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %topic,
                    subscription_id = id,
                    error = %err,
                    "Handler failed, continuing"
                );
            }
        }
    }
}

/// A subscription running in the background
pub struct SubscriptionHandle {
    topic: String,
    cancel: CancellationToken,
    join: JoinHandle<BusResult<StopReason>>,
}

impl SubscriptionHandle {
    pub fn spawn(subscription: Subscription) -> Self {
        let topic = subscription.topic.clone();
        let cancel = subscription.token();
        let join = tokio::spawn(subscription.run());
        Self {
            topic,
            cancel,
            join,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Request a stop without waiting for it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the subscription to end on its own
    pub async fn join(self) -> BusResult<StopReason> {
        match self.join.await {
            Ok(result) => result,
            Err(_) => Err(BusError::HandlerPanicked { topic: self.topic }),
        }
    }

    /// Cancel and wait up to `timeout` for the subscription to end
    pub async fn stop(self, timeout: Duration) -> BusResult<StopReason> {
        self.cancel.cancel();
        let topic = self.topic.clone();
        match tokio::time::timeout(timeout, self.join()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(topic = %topic, "Subscription did not stop in time");
                Err(BusError::StopTimeout { topic })
            }
        }
    }
}
