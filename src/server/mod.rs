//! HTTP Server
//!
//! Assembles the router the orchestrator hands back and runs it.
//!
//! # Endpoints
//!
//! ## Health (public)
//! - `GET /health/live` - Liveness probe
//! - `GET /health` - Runtime status
//!
//! ## Authenticated
//! - `GET /ws/<channel>` - WebSocket upgrade, one per bridge
//! - `/app/<module>/...` - Module routes

pub mod auth;
pub mod error;
pub mod health;

pub use auth::{authenticate, Authenticator, HeaderAuthenticator, UserIdentity};
pub use error::ApiError;
pub use health::HealthState;

use axum::{http::HeaderValue, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

/// Wrap the authenticated routes and mount the public ones
pub fn build_router(
    protected: Router,
    health: HealthState,
    authenticator: Arc<dyn Authenticator>,
    cors_origins: &[String],
) -> Router {
    let protected = protected.layer(axum::middleware::from_fn_with_state(
        authenticator,
        authenticate,
    ));

    Router::new()
        .nest("/health", health::routes(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve `router` until `shutdown` resolves, then stop accepting
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Trellis listening");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("HTTP server stopped accepting connections");
    Ok(())
}

/// Resolve on Ctrl+C, SIGTERM, or when `token` is cancelled
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lifecycle::{Bridges, ShutdownCoordinator};
    use crate::pubsub::InMemoryBus;
    use crate::registry::ServiceRegistry;
    use crate::topics::TopicManager;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use std::time::Instant;
    use tower::util::ServiceExt;

    fn app() -> Router {
        let health = HealthState {
            started: Instant::now(),
            modules: Arc::new(Vec::new()),
            registry: Arc::new(ServiceRegistry::new(Arc::new(Config::default()))),
            topics: Arc::new(TopicManager::new()),
            bus: InMemoryBus::default(),
            bridges: Bridges::default(),
            coordinator: Arc::new(ShutdownCoordinator::new()),
        };
        let protected = Router::new().route("/app/echo/ping", get(|| async { "pong" }));
        build_router(
            protected,
            health,
            Arc::new(HeaderAuthenticator),
            &["http://localhost:3000".to_string()],
        )
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/health/live")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_module_routes_require_identity() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/app/echo/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/app/echo/ping")
                    .header(auth::USER_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_shutdown_signal_follows_token() {
        let token = CancellationToken::new();
        let signal = tokio::spawn(shutdown_signal(token.clone()));
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal)
            .await
            .unwrap()
            .unwrap();
    }
}
