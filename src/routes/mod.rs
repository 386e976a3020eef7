//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an endpoint group. Every route except
//! [`health`] sits behind the origin check and then the token check from
//! [`crate::auth`].
//!
//! | Method | Path             | Handler                         |
//! |--------|------------------|---------------------------------|
//! | GET    | `/health`        | [`health::health`] (no gate)    |
//! | GET    | `/config`        | [`config::config`]              |
//! | GET    | `/stdio`         | [`sse::stdio`]                  |
//! | GET    | `/sse`           | [`sse::sse`]                    |
//! | POST   | `/message`       | [`sse::message`]                |
//! | GET    | `/mcp`           | [`mcp::get`]                    |
//! | POST   | `/mcp`           | [`mcp::post`]                   |
//! | DELETE | `/mcp`           | [`mcp::delete`]                 |
//! | POST   | `/tunnel/start`  | [`tunnel::start`]               |
//! | POST   | `/tunnel/stop`   | [`tunnel::stop`]                |
//! | GET    | `/tunnel/status` | [`tunnel::status`]              |

pub mod config;
pub mod health;
pub mod mcp;
pub mod sse;
pub mod tunnel;

use axum::{
    http::{HeaderName, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth;
use crate::state::AppState;
use crate::transport::{streamable::SESSION_HEADER, TransportError};

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health::health));

    let gated_routes = Router::new()
        .route("/config", get(config::config))
        .route("/stdio", get(sse::stdio))
        .route("/sse", get(sse::sse))
        .route("/message", post(sse::message))
        .route("/mcp", get(mcp::get).post(mcp::post).delete(mcp::delete))
        .route("/tunnel/start", post(tunnel::start))
        .route("/tunnel/stop", post(tunnel::stop))
        .route("/tunnel/status", get(tunnel::status))
        .layer(middleware::from_fn_with_state(
            state.gate.clone(),
            auth::require_token,
        ))
        .layer(middleware::from_fn_with_state(
            state.gate.clone(),
            auth::check_origin,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        .merge(public_routes)
        .merge(gated_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `{"error": message}` with `status`.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Answer a failed transport creation. Upstream 401/404 keep their status.
pub(crate) fn transport_failure(route: &str, e: &TransportError) -> Response {
    let status = e.status();
    if status == StatusCode::UNAUTHORIZED {
        error!("Received 401 Unauthorized from MCP server: {e}");
    } else if status == StatusCode::NOT_FOUND {
        error!("Received 404 not found from MCP server. Does the MCP server support {route}? {e}");
    } else if matches!(e, TransportError::ConnectionRefused(_)) {
        error!("Connection refused. Is the MCP server running?");
    } else {
        error!("Error in /{route} route: {e}");
    }
    error_response(status, e.to_string())
}
