//! Public tunnel control: `POST /tunnel/start`, `POST /tunnel/stop`,
//! `GET /tunnel/status`.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use super::error_response;
use crate::tunnel::{TunnelError, TunnelStatus, TunnelTarget};
use crate::AppState;

fn tunnel_failure(action: &str, e: &TunnelError) -> Response {
    error!("Failed to {action} tunnel: {e}");
    error_response(e.status(), e.to_string())
}

/// `POST /tunnel/start`: `{port?, url?, transportType}` →
/// `{success, publicUrl, localPort, directMapping, originalUrl?}`.
pub async fn start(State(state): State<AppState>, Json(target): Json<TunnelTarget>) -> Response {
    match state.tunnel.start(&target).await {
        Ok(info) => {
            let mut body = json!({ "success": true });
            if let (Value::Object(body), Ok(Value::Object(info))) =
                (&mut body, serde_json::to_value(&info))
            {
                body.extend(info);
            }
            Json(body).into_response()
        }
        Err(e) => tunnel_failure("start", &e),
    }
}

/// `POST /tunnel/stop`: `{success: true}`.
pub async fn stop(State(state): State<AppState>) -> Response {
    match state.tunnel.stop().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => tunnel_failure("stop", &e),
    }
}

/// `GET /tunnel/status`: `{running, publicUrl}`.
pub async fn status(State(state): State<AppState>) -> Json<TunnelStatus> {
    Json(state.tunnel.status().await)
}
