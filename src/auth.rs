//! Request gatekeeping: origin allow-listing and proxy token authentication.
//!
//! Every route except `/health` passes through both checks, origin first:
//!
//! - **Origin**: requests without an `Origin` header (curl, SDKs, `file://`
//!   pages) pass. Browser requests must come from an allow-listed origin,
//!   which blocks DNS-rebinding attacks against the local proxy.
//! - **Token**: the caller presents the per-process [`SessionToken`] either as
//!   `?MCP_PROXY_AUTH_TOKEN=<token>` (EventSource can't set headers) or as
//!   `X-MCP-Proxy-Auth: Bearer <token>`. Disabled by
//!   `security.auth_disabled`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rand::RngCore;
use serde_json::json;
use tracing::warn;

/// Query parameter carrying the proxy token.
pub const TOKEN_QUERY_PARAM: &str = "MCP_PROXY_AUTH_TOKEN";

/// Header carrying the proxy token as `Bearer <token>`.
pub const TOKEN_HEADER: &str = "x-mcp-proxy-auth";

/// Random per-process secret compared against caller-supplied tokens.
///
/// `Debug` is redacted so the value can't leak through logs.
#[derive(Clone)]
pub struct SessionToken(Arc<str>);

impl SessionToken {
    /// 32 random bytes, hex-encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex.into())
    }

    /// The raw token, for the startup banner only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length check, then constant-time comparison of the bytes.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let provided = candidate.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        constant_time_eq(expected, provided)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Compare two equal-length byte strings without early exit.
///
/// Callers must reject length mismatches first; this only guards the content.
fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    debug_assert_eq!(expected.len(), provided.len());
    let diff = expected
        .iter()
        .zip(provided)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
}

/// Everything both middlewares need, injected as router state.
#[derive(Clone)]
pub struct SecurityGate {
    allowed_origins: Arc<[String]>,
    token: SessionToken,
    auth_disabled: bool,
}

impl SecurityGate {
    pub fn new(allowed_origins: Vec<String>, token: SessionToken, auth_disabled: bool) -> Self {
        Self {
            allowed_origins: allowed_origins.into(),
            token,
            auth_disabled,
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == origin)
    }
}

/// Reject browser requests from origins outside the allow-list with `403`.
pub async fn check_origin(
    State(gate): State<SecurityGate>,
    request: Request,
    next: Next,
) -> Response {
    let Some(origin) = request.headers().get(header::ORIGIN) else {
        return next.run(request).await;
    };
    let allowed = origin.to_str().is_ok_and(|o| gate.origin_allowed(o));
    if !allowed {
        warn!(origin = ?origin, "Rejected request from invalid origin");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Forbidden - invalid origin",
                "message": "Request blocked to prevent DNS rebinding attacks. Configure allowed origins via environment variable.",
            })),
        )
            .into_response();
    }
    next.run(request).await
}

/// Reject requests without a valid proxy token with `401`.
///
/// Missing, malformed and wrong tokens all get the same response body.
pub async fn require_token(
    State(gate): State<SecurityGate>,
    request: Request,
    next: Next,
) -> Response {
    if gate.auth_disabled {
        return next.run(request).await;
    }
    match provided_token(&request) {
        Some(token) if gate.token.matches(&token) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "Authentication required. Use the session token shown in the console when starting the server.",
            })),
        )
            .into_response(),
    }
}

/// Token from the query string, falling back to the bearer header.
fn provided_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == TOKEN_QUERY_PARAM)
            .map(|(_, v)| v.into_owned())
    });
    if let Some(token) = from_query.filter(|t| !t.is_empty()) {
        return Some(token);
    }
    request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
}
