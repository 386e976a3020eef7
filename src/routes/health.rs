//! Unauthenticated health-check endpoint.

use axum::Json;
use serde_json::{json, Value};

/// `GET /health`: liveness probe. No origin or token checks.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
