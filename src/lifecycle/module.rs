//! Module contract
//!
//! A module is a named unit of application code. The orchestrator drives
//! every module through two phases:
//!
//! 1. **register**: publish services and topics. Must not resolve services
//!    owned by other modules.
//! 2. **boot**: resolve dependencies, start background work, attach routes.
//!    Runs only after every module has registered.
//!
//! `shutdown` is called in reverse declaration order.

use async_trait::async_trait;
use axum::routing::MethodRouter;
use axum::Router;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::shutdown::ShutdownCoordinator;
use crate::config::{Config, ConfigError};
use crate::registry::{RegistryResult, ServiceKey, ServiceRegistry};
use crate::topics::{define_module, Topic, TopicConfig, TopicManager, TopicResult};

/// A unit of application code driven by the orchestrator
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable identifier; also the HTTP subpath `/app/<name>`
    fn name(&self) -> &str;

    /// Phase 1: publish services and topics
    async fn register(&self, registrar: &Registrar<'_>) -> anyhow::Result<()>;

    /// Phase 2: resolve dependencies, start workers, attach routes
    async fn boot(&self, ctx: &mut BootContext) -> anyhow::Result<()>;

    /// Stop background work within `timeout`
    async fn shutdown(&self, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a module may touch while registering
pub struct Registrar<'a> {
    module: &'a str,
    registry: &'a ServiceRegistry,
    topics: &'a TopicManager,
}

impl<'a> Registrar<'a> {
    pub(crate) fn new(
        module: &'a str,
        registry: &'a ServiceRegistry,
        topics: &'a TopicManager,
    ) -> Self {
        Self {
            module,
            registry,
            topics,
        }
    }

    pub fn module(&self) -> &str {
        self.module
    }

    /// Publish a service
    pub fn provide<T>(&self, key: &ServiceKey<T>, value: impl Into<Arc<T>>) -> RegistryResult<()>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.registry.set(key, value)
    }

    /// Define and register a topic owned by this module
    pub fn topic(&self, config: TopicConfig) -> TopicResult<Topic> {
        let topic = define_module(config.module(self.module));
        self.topics.register(topic.clone())?;
        Ok(topic)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        self.registry
    }

    pub fn topics(&self) -> &TopicManager {
        self.topics
    }

    pub fn config(&self) -> &Config {
        self.registry.config()
    }

    /// This module's `[modules.<name>]` table, or `T::default()`
    pub fn module_config<T>(&self) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        self.registry.config().module(self.module)
    }
}

/// Routes a module mounts under `/app/<name>`
#[derive(Default)]
pub struct RouterGroup {
    prefix: String,
    router: Router,
    routes: usize,
}

impl RouterGroup {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            router: Router::new(),
            routes: 0,
        }
    }

    /// Path the group is nested at
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Add a route relative to the group prefix
    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.router = std::mem::take(&mut self.router).route(path, method_router);
        self.routes += 1;
        self
    }

    /// Merge a router that already carries its own state
    pub fn merge(&mut self, router: Router) -> &mut Self {
        self.router = std::mem::take(&mut self.router).merge(router);
        self.routes += 1;
        self
    }

    pub fn has_routes(&self) -> bool {
        self.routes > 0
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

/// What a module receives while booting
pub struct BootContext {
    module: String,
    token: CancellationToken,
    router: RouterGroup,
    registry: Arc<ServiceRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl BootContext {
    pub(crate) fn new(
        module: &str,
        registry: Arc<ServiceRegistry>,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            module: module.to_string(),
            token: coordinator.child_token(),
            router: RouterGroup::new(format!("/app/{module}")),
            registry,
            coordinator,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Cancelled when the runtime shuts down
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn router(&mut self) -> &mut RouterGroup {
        &mut self.router
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Run a background task the orchestrator waits for at shutdown
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.coordinator.spawn(task)
    }

    pub(crate) fn into_router(self) -> RouterGroup {
        self.router
    }
}
