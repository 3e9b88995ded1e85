//! Service registry error types

use thiserror::Error;

/// Errors returned by the service registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A value is already stored under this key
    #[error("Service '{key}' is already registered (as {existing_type})")]
    Duplicate {
        key: String,
        existing_type: &'static str,
    },

    /// The registration phase is over
    #[error("Service registry is sealed, cannot register '{key}'")]
    Sealed { key: String },

    /// Nothing (of the requested type) is stored under this key
    #[error("Service '{key}' is not registered")]
    Missing { key: String },
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
