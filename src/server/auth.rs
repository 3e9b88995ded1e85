//! Authentication seam
//!
//! The runtime does not own sessions or credentials. An [`Authenticator`]
//! resolves the caller, and the [`authenticate`] middleware places the
//! resulting [`UserIdentity`] on the request for module handlers and
//! WebSocket upgrades to read.

use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;

use super::error::ApiError;

/// Header read by [`HeaderAuthenticator`]
pub const USER_HEADER: &str = "x-user-id";

/// The authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Resolves the caller of a request
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` rejects the request with 401
    async fn identify(&self, parts: &Parts) -> Option<UserIdentity>;
}

/// Trusts the `x-user-id` header, or a `user` query parameter
///
/// Browsers cannot set headers on WebSocket handshakes, hence the query
/// fallback. Development and tests only.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAuthenticator;

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn identify(&self, parts: &Parts) -> Option<UserIdentity> {
        let from_header = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(UserIdentity::new);
        if from_header.is_some() {
            return from_header;
        }

        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri).ok()?;
        params
            .get("user")
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(UserIdentity::new)
    }
}

/// Middleware: attach the caller's identity or answer 401
pub async fn authenticate(
    State(authenticator): State<Arc<dyn Authenticator>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    match authenticator.identify(&parts).await {
        Some(identity) => {
            tracing::trace!(user_id = %identity.id, path = %parts.uri.path(), "Request authenticated");
            parts.extensions.insert(identity);
            next.run(Request::from_parts(parts, body)).await
        }
        None => ApiError::Unauthorized("No user identity on request".into()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http, http::StatusCode, routing::get, Extension, Router};
    use tower::util::ServiceExt;

    fn app() -> Router {
        let auth: Arc<dyn Authenticator> = Arc::new(HeaderAuthenticator);
        Router::new()
            .route(
                "/whoami",
                get(|Extension(identity): Extension<UserIdentity>| async move { identity.id }),
            )
            .layer(axum::middleware::from_fn_with_state(auth, authenticate))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_header_identity() {
        let response = app()
            .oneshot(
                http::Request::builder()
                    .uri("/whoami")
                    .header(USER_HEADER, "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "alice");
    }

    #[tokio::test]
    async fn test_query_identity() {
        let response = app()
            .oneshot(
                http::Request::builder()
                    .uri("/whoami?user=bob")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "bob");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        for uri in ["/whoami", "/whoami?user="] {
            let response = app()
                .oneshot(http::Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }
}
