//! Pub/Sub Bus
//!
//! Topic-addressed messaging between modules and bridges:
//!
//! - **message**: `Message` (bytes payload plus string metadata)
//! - **policy**: `BusConfig` and `BackpressurePolicy`
//! - **bus**: `InMemoryBus`, the in-process implementation
//! - **subscription**: per-subscription delivery tasks
//! - **error**: `BusError` and `StopReason`
//!
//! Delivery is FIFO per topic per publisher. Each subscription is drained by
//! its own task, so a slow handler only ever delays itself.

pub mod bus;
pub mod error;
pub mod message;
pub mod policy;
mod queue;
pub mod subscription;

pub use bus::{BusStats, InMemoryBus};
pub use error::{BusError, BusResult, StopReason};
pub use message::{Message, Metadata};
pub use policy::{BackpressurePolicy, BusConfig};
pub use subscription::{Subscription, SubscriptionHandle};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Message handler
///
/// Errors are logged and the subscription continues, except
/// [`BusError::Cancelled`], which ends the subscription normally.
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Publishing side of the bus
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message to its topic
    ///
    /// Returns once the message is queued for (or dropped by policy from)
    /// every current subscriber. Publishing to a topic nobody listens on is
    /// not an error.
    async fn publish(&self, message: Message) -> BusResult<()>;

    /// Publish, giving up on blocked subscribers once `cancel` fires
    ///
    /// Returns [`BusError::Cancelled`] if the token fired before or during
    /// the fan-out. Subscribers with room still receive the message.
    async fn publish_with(&self, cancel: &CancellationToken, message: Message) -> BusResult<()>;
}

/// Subscribing side of the bus
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Install a subscription without starting delivery
    ///
    /// Cancelling `cancel` (or any parent of it) stops the subscription.
    fn open(&self, cancel: &CancellationToken, topic: &str, handler: Handler)
        -> BusResult<Subscription>;

    /// Deliver messages to `handler` until cancelled
    ///
    /// Returns `Ok` on cancellation or bus close, `Err` on eviction or a
    /// handler panic. No handler invocation is running once this returns.
    async fn subscribe(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        handler: Handler,
    ) -> BusResult<StopReason> {
        self.open(cancel, topic, handler)?.run().await
    }

    /// Install a subscription and run it in the background
    fn spawn(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        handler: Handler,
    ) -> BusResult<SubscriptionHandle> {
        Ok(SubscriptionHandle::spawn(self.open(cancel, topic, handler)?))
    }
}
