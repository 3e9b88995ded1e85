//! Topic Manager
//!
//! Typed topic definitions and their registry:
//!
//! - **topic**: `Topic`, `TopicScope`, `TopicConfig` and the pure constructors
//! - **validation**: naming rules shared by every component
//! - **manager**: registration, lookup and discovery
//! - **framework**: topics owned by the runtime, derived bridge topic names
//! - **error**: structured errors
//!
//! # Naming
//!
//! ```text
//! name      := segment ("." segment)*      (≤ 100 chars)
//! segment   := [a-z][a-z0-9]*
//! reserved  := system.* | internal.* | debug.*
//! framework := ws.* | presence.* | auth.* | server.*   (no module)
//! module    := [a-z][a-z0-9_]*              (≤ 50 chars)
//! ```

pub mod error;
pub mod framework;
pub mod manager;
pub mod topic;
pub mod validation;

pub use error::{TopicError, TopicErrorKind, TopicResult};
pub use framework::{
    broadcast_topic, default_manager, direct_topic, install_default, register_framework_topics,
};
pub use manager::{AccessDecision, AccessKind, RegistryEntry, TopicManager, TopicStats};
pub use topic::{define_framework, define_module, Topic, TopicConfig, TopicScope};
pub use validation::{validate_module_name, validate_topic_name};
