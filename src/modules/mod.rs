//! Built-in modules

pub mod presence;

pub use presence::{PresenceModule, PresenceTracker};
