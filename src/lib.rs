//! # Trellis
//!
//! Runtime for modular web applications: modules publish services and
//! topics, talk to each other over an in-process bus, and reach browsers
//! through WebSocket bridges.
//!
//! ## Modules
//!
//! - [`registry`]: typed service registry
//! - [`topics`]: topic definitions, validation and discovery
//! - [`pubsub`]: in-memory publish/subscribe bus
//! - [`bridge`]: WebSocket bridges between the bus and browsers
//! - [`lifecycle`]: module contract and orchestrator
//! - [`server`]: HTTP assembly, authentication seam, health routes
//! - [`modules`]: built-in modules
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis::{Config, Orchestrator, PresenceModule};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::load_default());
//!     let orchestrator = Orchestrator::builder(Arc::clone(&config))
//!         .module(PresenceModule::default())
//!         .build()?;
//!
//!     let router = orchestrator.start().await?;
//!     let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
//!     trellis::server::serve(
//!         listener,
//!         router,
//!         trellis::server::shutdown_signal(orchestrator.token()),
//!     )
//!     .await?;
//!
//!     orchestrator.shutdown(config.server.shutdown_timeout()).await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod modules;
pub mod pubsub;
pub mod registry;
pub mod server;
pub mod topics;

pub use bridge::{Bridge, BridgeConfig, BridgeError, ClientEvent};

pub use config::{Config, ConfigError, LoggingConfig};

pub use lifecycle::{
    BootContext, BootFailurePolicy, LifecycleError, Module, Orchestrator, Registrar, RouterGroup,
};

pub use modules::{PresenceModule, PresenceTracker};

pub use pubsub::{
    handler_fn, BackpressurePolicy, BusConfig, BusError, Handler, InMemoryBus, Message, Publisher,
    StopReason, Subscriber, SubscriptionHandle,
};

pub use registry::{RegistryError, ServiceKey, ServiceRegistry};

pub use server::{ApiError, Authenticator, HeaderAuthenticator, UserIdentity};

pub use topics::{Topic, TopicConfig, TopicError, TopicManager, TopicScope};
