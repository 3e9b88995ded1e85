//! Health Routes
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health - Runtime status with component details

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::lifecycle::{Bridges, ShutdownCoordinator};
use crate::pubsub::{BusStats, InMemoryBus};
use crate::registry::ServiceRegistry;
use crate::topics::{TopicManager, TopicStats};

/// What the health endpoint reports on
#[derive(Clone)]
pub struct HealthState {
    pub(crate) started: Instant,
    pub(crate) modules: Arc<Vec<String>>,
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) topics: Arc<TopicManager>,
    pub(crate) bus: InMemoryBus,
    pub(crate) bridges: Bridges,
    pub(crate) coordinator: Arc<ShutdownCoordinator>,
}

impl HealthState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// ok, starting or stopping
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub version: String,
    /// Modules that booted
    pub modules: Vec<String>,
    pub services: Vec<&'static str>,
    pub topics: TopicStats,
    pub bus: BusStats,
    pub bridges: Vec<BridgeHealth>,
}

#[derive(Debug, Serialize)]
pub struct BridgeHealth {
    pub channel: String,
    pub accepting: bool,
    pub connections: usize,
}

/// `/health` router
pub fn routes(state: HealthState) -> Router {
    Router::new()
        .route("/", get(full_health))
        .route("/live", get(liveness))
        .with_state(state)
}

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health
///
/// Answers 503 while the runtime is stopping so load balancers drain it.
pub async fn full_health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let status = if state.coordinator.is_shutting_down() {
        "stopping"
    } else if !state.topics.is_active() {
        "starting"
    } else {
        "ok"
    };
    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let bridges = state
        .bridges
        .iter()
        .map(|bridge| BridgeHealth {
            channel: bridge.channel().to_string(),
            accepting: bridge.is_accepting(),
            connections: bridge.active_connections(),
        })
        .collect();

    let mut services = state.registry.keys();
    services.sort_unstable();

    (
        code,
        Json(HealthResponse {
            status,
            uptime_seconds: state.uptime_seconds(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            modules: state.modules.as_ref().clone(),
            services,
            topics: state.topics.stats(),
            bus: state.bus.stats(),
            bridges,
        }),
    )
}
