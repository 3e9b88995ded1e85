//! Lifecycle errors

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::registry::RegistryError;
use crate::topics::TopicError;

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while starting the runtime
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Failed to register framework topics: {0}")]
    FrameworkTopics(#[source] TopicError),

    #[error("Invalid module name '{module}': {source}")]
    InvalidModuleName {
        module: String,
        #[source]
        source: TopicError,
    },

    #[error("Module '{0}' is declared twice")]
    DuplicateModule(String),

    #[error("Module '{module}' failed to register: {source}")]
    Register {
        module: String,
        #[source]
        source: Cause,
    },

    #[error("Module '{module}' failed to boot: {source}")]
    Boot {
        module: String,
        #[source]
        source: Cause,
    },

    #[error("Bridge '{channel}' failed to start: {source}")]
    Bridge {
        channel: String,
        #[source]
        source: BridgeError,
    },

    #[error("Service registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Runtime already started")]
    AlreadyStarted,
}

impl LifecycleError {
    /// Name of the module at fault, if one is
    pub fn module(&self) -> Option<&str> {
        match self {
            LifecycleError::InvalidModuleName { module, .. }
            | LifecycleError::Register { module, .. }
            | LifecycleError::Boot { module, .. } => Some(module),
            LifecycleError::DuplicateModule(module) => Some(module),
            _ => None,
        }
    }
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;
