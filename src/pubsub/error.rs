//! Pub/sub error types

use thiserror::Error;

/// Errors returned by the bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus was closed; no further publish or subscribe is possible
    #[error("Bus is closed")]
    Closed,

    /// Returned by a handler to end its own subscription
    #[error("Subscription cancelled")]
    Cancelled,

    /// The subscription overflowed under the evict-subscriber policy
    #[error("Subscription to '{topic}' was evicted for falling behind")]
    Evicted { topic: String },

    /// A handler panicked; the subscription was stopped
    #[error("Handler for '{topic}' panicked")]
    HandlerPanicked { topic: String },

    /// A background subscription did not stop within its deadline
    #[error("Subscription to '{topic}' did not stop in time")]
    StopTimeout { topic: String },
}

impl BusError {
    /// Whether a handler error is the cancellation sentinel
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<BusError>(), Some(BusError::Cancelled))
    }
}

/// Why a subscription ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Its cancellation token fired (or the handler asked to stop)
    Cancelled,
    /// The bus was closed underneath it
    BusClosed,
}

/// Result type alias for bus operations
pub type BusResult<T> = Result<T, BusError>;
