//! Prefill values for the connect form.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /config`: default command and arguments from the command line.
///
/// `defaultEnvironment` is always empty; the proxy's own environment is never
/// sent to the browser.
pub async fn config(State(state): State<AppState>) -> Json<Value> {
    let defaults = &state.config.defaults;
    Json(json!({
        "defaultEnvironment": {},
        "defaultCommand": defaults.command,
        "defaultArgs": defaults.args,
    }))
}
