//! Bus configuration and backpressure policy

use std::time::Duration;

/// What a publisher does when a subscriber's queue is full
///
/// There is no unbounded mode: every bus picks one of these explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait up to the given duration for space, then drop the new message
    /// for that subscriber and log a warning
    BlockBounded(Duration),
    /// Make room by discarding the oldest queued message
    DropOldest,
    /// Close the subscription; its `subscribe` call returns `Evicted`
    EvictSubscriber,
}

impl BackpressurePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            BackpressurePolicy::BlockBounded(_) => "block_bounded",
            BackpressurePolicy::DropOldest => "drop_oldest",
            BackpressurePolicy::EvictSubscriber => "evict_subscriber",
        }
    }
}

/// Configuration for an [`InMemoryBus`](super::InMemoryBus)
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of each subscription's queue
    pub queue_capacity: usize,
    pub policy: BackpressurePolicy,
    /// How long an in-flight handler may keep running after cancellation
    pub handler_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            policy: BackpressurePolicy::BlockBounded(Duration::from_millis(50)),
            handler_grace: Duration::from_secs(2),
        }
    }
}

impl BusConfig {
    /// Builder method: set the queue capacity (minimum 1)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Builder method: set the backpressure policy
    pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder method: set the handler grace window
    pub fn handler_grace(mut self, grace: Duration) -> Self {
        self.handler_grace = grace;
        self
    }
}
