//! Module Lifecycle
//!
//! Modules are declared on an [`Orchestrator`], which registers them, seals
//! the service registry, boots them, and tears them down in reverse order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trellis::lifecycle::Orchestrator;
//! use trellis::modules::PresenceModule;
//!
//! let orchestrator = Orchestrator::builder(config)
//!     .module(PresenceModule::default())
//!     .build()?;
//! let router = orchestrator.start().await?;
//! // ... serve router ...
//! orchestrator.shutdown(Duration::from_secs(5)).await;
//! ```

mod error;
mod module;
mod orchestrator;
pub mod services;
mod shutdown;

pub use error::{LifecycleError, LifecycleResult};
pub use module::{BootContext, Module, Registrar, RouterGroup};
pub use orchestrator::{BootFailurePolicy, Orchestrator, OrchestratorBuilder};
pub use services::Bridges;
pub use shutdown::ShutdownCoordinator;
