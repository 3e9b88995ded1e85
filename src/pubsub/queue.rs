//! Bounded per-subscription queue
//!
//! A `VecDeque` behind a mutex with two `Notify`s, one for the single consumer
//! and one for blocked publishers. Unlike an mpsc channel it lets the
//! publisher displace the oldest entry, which the drop-oldest policy needs.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::message::Message;

/// Why a queue stopped accepting messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Evicted,
    BusClosed,
    Unsubscribed,
}

/// Outcome of offering a message to a queue
#[derive(Debug)]
pub(crate) enum Offer {
    Queued,
    /// Queue at capacity; the message is handed back
    Full(Message),
    Closed,
}

struct State {
    items: VecDeque<Message>,
    closed: Option<CloseReason>,
}

pub(crate) struct SubscriptionQueue {
    state: Mutex<State>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
}

impl SubscriptionQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: None,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn try_push(&self, message: Message) -> Offer {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return Offer::Closed;
        }
        if state.items.len() >= self.capacity {
            return Offer::Full(message);
        }
        state.items.push_back(message);
        drop(state);
        self.readable.notify_one();
        Offer::Queued
    }

    /// Wait until `deadline` for space
    ///
    /// A deadline already in the past degrades to [`try_push`](Self::try_push).
    pub async fn push_until(&self, mut message: Message, deadline: Instant) -> Offer {
        loop {
            let writable = self.writable.notified();
            match self.try_push(message) {
                Offer::Full(returned) => message = returned,
                other => return other,
            }
            if tokio::time::timeout_at(deadline, writable).await.is_err() {
                return self.try_push(message);
            }
        }
    }

    /// Push, discarding the oldest entry when full
    ///
    /// Returns the displaced message, or `Err` with the new one if the queue
    /// is closed.
    pub fn push_displacing(&self, message: Message) -> Result<Option<Message>, Message> {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return Err(message);
        }
        let displaced = if state.items.len() >= self.capacity {
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(message);
        drop(state);
        self.readable.notify_one();
        Ok(displaced)
    }

    /// Next message, or `None` once the queue is closed
    ///
    /// Messages still queued at close are discarded.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let readable = self.readable.notified();
            {
                let mut state = self.state.lock();
                if state.closed.is_some() {
                    return None;
                }
                if let Some(message) = state.items.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(message);
                }
            }
            readable.await;
        }
    }

    /// Close the queue; the first reason wins
    pub fn close(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
            state.items.clear();
        }
        drop(state);
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Count a message dropped for this subscriber, returning the new total
    pub fn record_drop(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
