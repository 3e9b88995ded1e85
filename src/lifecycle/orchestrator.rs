//! Module lifecycle orchestrator
//!
//! Start-up runs in two phases so that every service exists before anyone
//! resolves one:
//!
//! 1. framework topics and services are published, then each module
//!    registers in declaration order; the registry is sealed afterwards
//! 2. bridges start, then each module boots with its own router group and a
//!    token derived from the root token
//!
//! Shutdown runs once, whoever calls it first.

use axum::Router;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{LifecycleError, LifecycleResult};
use super::module::{BootContext, Module, Registrar};
use super::services::{self, Bridges};
use super::shutdown::ShutdownCoordinator;
use crate::bridge::{Bridge, BridgeConfig};
use crate::config::Config;
use crate::pubsub::{InMemoryBus, Message, Publisher, Subscriber};
use crate::registry::ServiceRegistry;
use crate::server::{self, Authenticator, HeaderAuthenticator, HealthState};
use crate::topics::framework::{register_framework_topics, SERVER_STARTED, SERVER_STOPPING};
use crate::topics::{validate_module_name, TopicManager};

/// What happens when a module fails to boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootFailurePolicy {
    /// Stop start-up and return the error
    #[default]
    Abort,
    /// Log the failure and boot the remaining modules
    Continue,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: Arc<Config>,
    modules: Vec<Arc<dyn Module>>,
    topics: Option<Arc<TopicManager>>,
    bus: Option<InMemoryBus>,
    authenticator: Option<Arc<dyn Authenticator>>,
    policy: Option<BootFailurePolicy>,
}

impl OrchestratorBuilder {
    /// Declare a module; declaration order is registration and boot order
    pub fn module<M: Module + 'static>(mut self, module: M) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    /// Use an existing topic manager instead of a fresh one
    pub fn topics(mut self, topics: Arc<TopicManager>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Use an existing bus instead of one built from `[bus]`
    pub fn bus(mut self, bus: InMemoryBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Defaults to [`HeaderAuthenticator`]
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Override `lifecycle.boot_failure`
    pub fn boot_failure(mut self, policy: BootFailurePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> LifecycleResult<Orchestrator> {
        let mut seen = HashSet::new();
        for module in &self.modules {
            let name = module.name();
            validate_module_name(name).map_err(|source| LifecycleError::InvalidModuleName {
                module: name.to_string(),
                source,
            })?;
            if !seen.insert(name.to_string()) {
                return Err(LifecycleError::DuplicateModule(name.to_string()));
            }
        }

        let config = self.config;
        let bus = self
            .bus
            .unwrap_or_else(|| InMemoryBus::new(config.bus.to_bus_config()));
        let topics = self.topics.unwrap_or_else(|| Arc::new(TopicManager::new()));

        let mut bridges = Bridges::default();
        for channel in &config.websocket.channels {
            if bridges.get(channel).is_some() {
                warn!(channel = %channel, "Channel listed twice, ignoring duplicate");
                continue;
            }
            let publisher: Arc<dyn Publisher> = Arc::new(bus.clone());
            let subscriber: Arc<dyn Subscriber> = Arc::new(bus.clone());
            let bridge = Bridge::new(
                BridgeConfig::from_settings(channel.as_str(), &config.websocket),
                publisher,
                subscriber,
                Arc::clone(&topics),
            )
            .map_err(|source| LifecycleError::Bridge {
                channel: channel.clone(),
                source,
            })?;
            bridges.insert(bridge);
        }

        let policy = self
            .policy
            .unwrap_or_else(|| config.lifecycle.boot_failure_policy());
        let authenticator: Arc<dyn Authenticator> = match self.authenticator {
            Some(authenticator) => authenticator,
            None => Arc::new(HeaderAuthenticator),
        };

        Ok(Orchestrator {
            registry: Arc::new(ServiceRegistry::new(Arc::clone(&config))),
            config,
            topics,
            bus,
            bridges,
            modules: self.modules,
            policy,
            authenticator,
            coordinator: Arc::new(ShutdownCoordinator::new()),
            started: AtomicBool::new(false),
            booted: Mutex::new(Vec::new()),
            created: Instant::now(),
        })
    }
}

/// Drives modules and framework components through start-up and shutdown
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<ServiceRegistry>,
    topics: Arc<TopicManager>,
    bus: InMemoryBus,
    bridges: Bridges,
    modules: Vec<Arc<dyn Module>>,
    policy: BootFailurePolicy,
    authenticator: Arc<dyn Authenticator>,
    coordinator: Arc<ShutdownCoordinator>,
    started: AtomicBool,
    booted: Mutex<Vec<String>>,
    created: Instant,
}

impl Orchestrator {
    pub fn builder(config: Arc<Config>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            modules: Vec::new(),
            topics: None,
            bus: None,
            authenticator: None,
            policy: None,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    pub fn bus(&self) -> &InMemoryBus {
        &self.bus
    }

    pub fn bridges(&self) -> &Bridges {
        &self.bridges
    }

    pub fn bridge(&self, channel: &str) -> Option<&Bridge> {
        self.bridges.get(channel)
    }

    pub fn policy(&self) -> BootFailurePolicy {
        self.policy
    }

    /// Child of the root token; cancelled when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.coordinator.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Declared module names, in order
    pub fn modules(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Modules whose boot succeeded
    pub fn booted_modules(&self) -> Vec<String> {
        self.booted.lock().clone()
    }

    /// Run both phases and return the application router
    ///
    /// On error the caller still owns shutdown: anything already started
    /// is torn down by [`Orchestrator::shutdown`].
    pub async fn start(&self) -> LifecycleResult<Router> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::AlreadyStarted);
        }
        let begin = Instant::now();
        info!(
            modules = self.modules.len(),
            channels = self.bridges.len(),
            policy = ?self.policy,
            "Starting runtime"
        );

        let channels = self.bridges.channels();
        register_framework_topics(&self.topics, &channels)
            .map_err(LifecycleError::FrameworkTopics)?;
        self.publish_framework_services()?;

        for module in &self.modules {
            let name = module.name();
            let registrar = Registrar::new(name, &self.registry, &self.topics);
            if let Err(e) = module.register(&registrar).await {
                error!(module = %name, error = %e, "Module registration failed");
                return Err(LifecycleError::Register {
                    module: name.to_string(),
                    source: e.into(),
                });
            }
            debug!(module = %name, "Module registered");
        }
        self.registry.seal();
        info!(services = self.registry.len(), "Service registry sealed");

        let root = self.coordinator.token();
        for bridge in self.bridges.iter() {
            bridge
                .start(&root)
                .map_err(|source| LifecycleError::Bridge {
                    channel: bridge.channel().to_string(),
                    source,
                })?;
        }

        let mut routes = Router::new();
        let mut booted = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let name = module.name();
            let mut ctx = BootContext::new(
                name,
                Arc::clone(&self.registry),
                Arc::clone(&self.coordinator),
            );
            match module.boot(&mut ctx).await {
                Ok(()) => {
                    let group = ctx.into_router();
                    if group.has_routes() {
                        let prefix = group.prefix().to_string();
                        routes = routes.nest(&prefix, group.into_router());
                    }
                    booted.push(name.to_string());
                    info!(module = %name, "Module booted");
                }
                Err(e) => match self.policy {
                    BootFailurePolicy::Abort => {
                        error!(module = %name, error = %e, "Module failed to boot, aborting start-up");
                        *self.booted.lock() = booted;
                        return Err(LifecycleError::Boot {
                            module: name.to_string(),
                            source: e.into(),
                        });
                    }
                    BootFailurePolicy::Continue => {
                        error!(module = %name, error = %e, "Module failed to boot, continuing without it");
                    }
                },
            }
        }

        for bridge in self.bridges.iter() {
            routes = routes.merge(bridge.routes());
        }

        if let Err(e) = self.topics.start() {
            warn!(error = %e, "Topic manager was already running");
        }
        *self.booted.lock() = booted.clone();

        self.announce(
            SERVER_STARTED,
            json!({ "modules": booted, "channels": channels }),
        )
        .await;

        let health = HealthState {
            started: self.created,
            modules: Arc::new(booted),
            registry: Arc::clone(&self.registry),
            topics: Arc::clone(&self.topics),
            bus: self.bus.clone(),
            bridges: self.bridges.clone(),
            coordinator: Arc::clone(&self.coordinator),
        };

        info!(
            elapsed_ms = begin.elapsed().as_millis() as u64,
            topics = self.topics.count(),
            "Runtime started"
        );

        Ok(server::build_router(
            routes,
            health,
            Arc::clone(&self.authenticator),
            &self.config.server.cors_origins,
        ))
    }

    /// Stop everything within `timeout`
    ///
    /// Only the first call does any work; later calls return immediately.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.coordinator.begin() {
            debug!("Shutdown already in progress");
            return;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());
        info!(timeout_ms = timeout.as_millis() as u64, "Shutting down runtime");

        self.announce(SERVER_STOPPING, json!({})).await;
        self.coordinator.cancel();

        for module in self.modules.iter().rev() {
            let name = module.name();
            let budget = remaining();
            match tokio::time::timeout(budget, module.shutdown(budget)).await {
                Ok(Ok(())) => debug!(module = %name, "Module stopped"),
                Ok(Err(e)) => warn!(module = %name, error = %e, "Module shutdown failed"),
                Err(_) => warn!(module = %name, "Module shutdown timed out"),
            }
        }

        for bridge in self.bridges.iter() {
            bridge.shutdown(remaining()).await;
        }

        let abandoned = self.coordinator.drain(remaining()).await;

        if tokio::time::timeout(remaining(), self.bus.close())
            .await
            .is_err()
        {
            warn!("Bus did not close before the deadline");
        }
        self.topics.stop();

        info!(abandoned, "Runtime stopped");
    }

    fn publish_framework_services(&self) -> LifecycleResult<()> {
        let publisher: Arc<dyn Publisher> = Arc::new(self.bus.clone());
        let subscriber: Arc<dyn Subscriber> = Arc::new(self.bus.clone());

        self.registry
            .set(&services::TOPICS, Arc::clone(&self.topics))?;
        self.registry.set(&services::BUS, self.bus.clone())?;
        self.registry.set(&services::PUBLISHER, publisher)?;
        self.registry.set(&services::SUBSCRIBER, subscriber)?;
        self.registry.set(&services::BRIDGES, self.bridges.clone())?;
        Ok(())
    }

    async fn announce(&self, topic: &str, payload: serde_json::Value) {
        let message = match Message::json(topic, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to encode lifecycle event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(message).await {
            debug!(topic = %topic, error = %e, "Lifecycle event not published");
        }
    }
}
