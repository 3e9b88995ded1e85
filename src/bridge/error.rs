//! WebSocket bridge errors

use thiserror::Error;

use crate::pubsub::BusError;

/// Errors that can occur in a bridge or its hub
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid bridge channel '{0}': expected [a-z][a-z0-9]*")]
    InvalidChannel(String),

    #[error("Too many connections (limit: {limit})")]
    TooManyConnections { limit: usize },

    #[error("Hub event loop is not running")]
    HubClosed,

    #[error("Bridge is shutting down")]
    ShuttingDown,

    #[error("Failed to subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BusError,
    },
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
