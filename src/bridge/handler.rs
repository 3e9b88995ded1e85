//! WebSocket upgrade handler

use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    Extension,
};

use super::runtime::Bridge;
use crate::server::auth::UserIdentity;
use crate::server::error::ApiError;

/// GET /ws/<channel>
///
/// Requires a [`UserIdentity`] placed on the request by the authentication
/// layer.
pub async fn upgrade(
    State(bridge): State<Bridge>,
    identity: Option<Extension<UserIdentity>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(Extension(identity)) = identity else {
        return ApiError::Unauthorized("WebSocket upgrade requires an authenticated user".into())
            .into_response();
    };
    if !bridge.is_accepting() {
        return ApiError::ServiceUnavailable(format!(
            "{} bridge is not accepting connections",
            bridge.channel()
        ))
        .into_response();
    }

    let max_message = bridge.config().max_message_bytes;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| async move { bridge.accept(socket, identity.id) })
}
