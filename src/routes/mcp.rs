//! Streamable-HTTP session routes: `GET`, `POST` and `DELETE /mcp`.
//!
//! A `POST` without an `mcp-session-id` header starts a new session. The
//! client-facing transport mints the id while handling the `initialize`
//! request and returns it in the response header; every later request
//! carries it.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{error, info, warn};

use super::{error_response, transport_failure};
use crate::factory::ConnectParams;
use crate::relay::{self, ClientSide};
use crate::sessions::{ClientHandle, TerminateError};
use crate::transport::streamable::{
    StreamableServerHandle, StreamableServerTransport, SESSION_HEADER,
};
use crate::AppState;

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// Look up the streamable handle registered under `id`.
async fn streamable_handle(state: &AppState, id: &str) -> Option<StreamableServerHandle> {
    match state.sessions.get(id).await?.client {
        ClientHandle::Streamable(handle) => Some(handle),
        ClientHandle::Sse(_) => None,
    }
}

/// `GET /mcp`: open the standalone stream of an existing session.
pub async fn get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing mcp-session-id header");
    };
    info!(session = %session_id, "Received GET message for streamable HTTP transport");
    match streamable_handle(&state, &session_id).await {
        Some(handle) => handle.handle_get(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

/// `POST /mcp`: deliver a message, creating the session when no id is sent.
pub async fn post(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(session_id) = session_header(&headers) {
        info!(session = %session_id, "Received POST message for existing streamable HTTP session");
        return match streamable_handle(&state, &session_id).await {
            Some(handle) => handle.handle_post(&headers, &body).await,
            None => {
                warn!(session = %session_id, "Transport not found");
                error_response(
                    StatusCode::NOT_FOUND,
                    TerminateError::NotFound(session_id).to_string(),
                )
            }
        };
    }

    info!("New streamable HTTP connection request");
    let server = match state.factory.create(&params, &headers).await {
        Ok(server) => server,
        Err(e) => return transport_failure("mcp", &e),
    };

    let (handle, link) = StreamableServerTransport::open();
    let closer = link.closer();
    relay::spawn(
        state.sessions.clone(),
        ClientSide {
            link,
            handle: ClientHandle::Streamable(handle.clone()),
        },
        server,
    )
    .await;

    let response = handle.handle_post(&headers, &body).await;
    match handle.session_id() {
        Some(id) => info!(session = %id, "Created streamable HTTP client transport"),
        None => {
            // Nothing can reach this session again; tear the relay down.
            warn!(status = %response.status(), "First request did not initialize a session");
            closer.close();
        }
    }
    response
}

/// `DELETE /mcp`: terminate the session and its remote counterpart.
pub async fn delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing mcp-session-id header");
    };
    info!(session = %session_id, "Received DELETE message for streamable HTTP transport");
    match state.sessions.terminate(&session_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e @ TerminateError::NotFound(_)) => {
            error!("Error in /mcp DELETE route: {e}");
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::routes::{router, test_support::*};
    use crate::transport::streamable::SESSION_HEADER;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Upstream streamable server that answers every request with a JSON
    /// echo of its method and accepts notifications with 202.
    async fn json_upstream() -> String {
        let app = Router::new().route(
            "/mcp",
            post(|Json(message): Json<Value>| async move {
                match message.get("id") {
                    Some(id) => {
                        let method = message["method"].clone();
                        let mut response =
                            Json(json!({"jsonrpc": "2.0", "id": id, "result": {"method": method}}))
                                .into_response();
                        response
                            .headers_mut()
                            .insert(SESSION_HEADER, "upstream-1".parse().unwrap());
                        response
                    }
                    None => StatusCode::ACCEPTED.into_response(),
                }
            })
            .get(|| async { StatusCode::METHOD_NOT_ALLOWED })
            .delete(|| async { StatusCode::OK }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/mcp")
    }

    fn post_mcp(uri: &str) -> axum::http::request::Builder {
        authed(Request::post(uri))
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
    }

    async fn first_data(body: Body) -> Value {
        let mut stream = body.into_data_stream();
        let mut seen = String::new();
        loop {
            let chunk = stream.next().await.unwrap().unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if !seen.contains("\n\n") {
                continue;
            }
            if let Some(data) = seen.lines().find_map(|l| l.strip_prefix("data:")) {
                return serde_json::from_str(data.trim()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn initialize_creates_session_and_delete_removes_it() {
        let upstream = json_upstream().await;
        let state = state();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                post_mcp(&format!("/mcp?transportType=streamable-http&url={upstream}"))
                    .body(Body::from(
                        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let answer = first_data(response.into_body()).await;
        assert_eq!(answer["id"], 1);
        assert_eq!(answer["result"]["method"], "initialize");

        for _ in 0..100 {
            if state.sessions.get(&session).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.sessions.get(&session).await.is_some());

        let response = app
            .clone()
            .oneshot(
                post_mcp("/mcp")
                    .header(SESSION_HEADER, &session)
                    .body(Body::from(
                        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let answer = first_data(response.into_body()).await;
        assert_eq!(answer["id"], 2);

        let response = app
            .clone()
            .oneshot(
                authed(Request::delete("/mcp"))
                    .header(SESSION_HEADER, &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.sessions.get(&session).await.is_none());
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let app = router(state());
        let response = app
            .oneshot(
                post_mcp("/mcp")
                    .header(SESSION_HEADER, "missing")
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(response).await,
            json!({"error": "Transport not found for sessionId missing"})
        );
    }

    #[tokio::test]
    async fn delete_unknown_session_is_404() {
        let app = router(state());
        let response = app
            .oneshot(
                authed(Request::delete("/mcp"))
                    .header(SESSION_HEADER, "missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_without_header_is_400() {
        let app = router(state());
        let response = app
            .oneshot(authed(Request::delete("/mcp")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_initialize_first_request_leaves_no_session() {
        let upstream = json_upstream().await;
        let state = state();
        let app = router(state.clone());
        let response = app
            .oneshot(
                post_mcp(&format!("/mcp?transportType=streamable-http&url={upstream}"))
                    .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.sessions.is_empty().await);
    }
}
