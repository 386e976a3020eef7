//! Streaming-session routes: `GET /stdio`, `GET /sse`, `POST /message`.
//!
//! Both GET routes open a long-lived event stream to the client. The first
//! event names the message endpoint (`/message?sessionId=<id>`); the client
//! posts its messages there and reads everything else from the stream.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{error_response, transport_failure};
use crate::factory::ConnectParams;
use crate::relay::{self, ClientSide};
use crate::sessions::ClientHandle;
use crate::transport::sse::SseServerTransport;
use crate::AppState;

/// Path advertised in the endpoint event.
const MESSAGE_ENDPOINT: &str = "/message";

/// `GET /stdio`: stream a new session to any server kind.
pub async fn stdio(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    info!("New STDIO connection request");
    open_stream(state, "stdio", params, headers).await
}

/// `GET /sse`: legacy entry point, same behaviour as [`stdio`].
pub async fn sse(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    info!(
        "New SSE connection request. NOTE: the SSE transport is deprecated and has been \
         replaced by streamable HTTP"
    );
    open_stream(state, "sse", params, headers).await
}

async fn open_stream(
    state: AppState,
    route: &str,
    params: ConnectParams,
    headers: HeaderMap,
) -> Response {
    let server = match state.factory.create(&params, &headers).await {
        Ok(server) => server,
        Err(e) => return transport_failure(route, &e),
    };
    let kind = server.kind();

    let (handle, link, stream) = SseServerTransport::open(MESSAGE_ENDPOINT);
    let session_id = handle.session_id().to_string();
    info!(session = %session_id, transport = kind.as_str(), "Created client transport");

    relay::spawn(
        state.sessions.clone(),
        ClientSide {
            link,
            handle: ClientHandle::Sse(handle),
        },
        server,
    )
    .await;

    Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub session_id: Option<String>,
}

/// `POST /message?sessionId=<id>`: deliver one client message.
pub async fn message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<Value>,
) -> Response {
    let Some(session_id) = query.session_id else {
        return error_response(StatusCode::BAD_REQUEST, "Missing sessionId parameter");
    };
    let handle = match state.sessions.get(&session_id).await {
        Some(pair) => match pair.client {
            ClientHandle::Sse(handle) => handle,
            ClientHandle::Streamable(_) => {
                warn!(session = %session_id, "POST /message for a streamable HTTP session");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "Session does not use SSE transport",
                );
            }
        },
        None => {
            warn!(session = %session_id, "Could not find session");
            return error_response(StatusCode::NOT_FOUND, "Session not found");
        }
    };

    match handle.post(body).await {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(e) => {
            error!(session = %session_id, "Error in /message route: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::routes::{router, test_support::*};
    use axum::{body::Body, http::Request, http::StatusCode};
    use futures::{Stream, StreamExt};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_transport_type_is_rejected() {
        let app = router(state());
        let response = app
            .oneshot(
                authed(Request::get("/stdio?transportType=carrier-pigeon"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("carrier-pigeon"));
    }

    #[tokio::test]
    async fn missing_url_is_rejected() {
        let app = router(state());
        let response = app
            .oneshot(
                authed(Request::get("/sse?transportType=sse"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_404() {
        let app = router(state());
        let response = app
            .oneshot(
                authed(Request::post("/message?sessionId=nope"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await, json!({"error": "Session not found"}));
    }

    /// Upstream SSE server that announces an endpoint and echoes every
    /// posted message back on the stream. Serves `/sse`.
    async fn echo_upstream() -> SocketAddr {
        use axum::{
            extract::State,
            response::sse::{Event, Sse},
            routing::{get, post},
            Json, Router,
        };
        use serde_json::Value;
        use std::convert::Infallible;
        use tokio::sync::broadcast;

        let (tx, _) = broadcast::channel::<Value>(16);
        let app = Router::new()
            .route(
                "/sse",
                get(|State(tx): State<broadcast::Sender<Value>>| async move {
                    let rx = tx.subscribe();
                    let first = futures::stream::once(async {
                        let endpoint = Event::default().event("endpoint").data("/upstream-message");
                        Ok::<_, Infallible>(endpoint)
                    });
                    let rest = futures::stream::unfold(rx, |mut rx| async move {
                        let message = rx.recv().await.ok()?;
                        let event = Event::default().event("message").data(message.to_string());
                        Some((Ok::<_, Infallible>(event), rx))
                    });
                    Sse::new(first.chain(rest))
                }),
            )
            .route(
                "/upstream-message",
                post(
                    |State(tx): State<broadcast::Sender<Value>>,
                     Json(message): Json<Value>| async move {
                        let _ = tx.send(message);
                        StatusCode::ACCEPTED
                    },
                ),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// `data:` lines of the complete events in `text`.
    fn data_lines(text: &str) -> Vec<String> {
        let complete = text.rfind("\n\n").map_or("", |end| &text[..end]);
        complete
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| d.trim().to_string())
            .collect()
    }

    /// Read `body` until a complete event carries a data line `wanted` accepts.
    async fn next_data<S, B, E>(body: &mut S, wanted: impl Fn(&str) -> bool) -> String
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Debug,
    {
        let mut seen = Vec::new();
        loop {
            let chunk = body.next().await.unwrap().unwrap();
            seen.extend_from_slice(chunk.as_ref());
            let text = String::from_utf8_lossy(&seen);
            if let Some(line) = data_lines(&text).into_iter().find(|l| wanted(l)) {
                return line;
            }
        }
    }

    fn post_message(endpoint: String, body: &'static str) -> Request<Body> {
        authed(Request::post(endpoint))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn relays_message_through_remote_sse_server() {
        let upstream = echo_upstream().await;
        let state = state();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                authed(Request::get(format!("/sse?transportType=sse&url=http://{upstream}/sse")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();

        let endpoint = next_data(&mut body, |_| true).await;
        assert!(endpoint.starts_with("/message?sessionId="));
        assert_eq!(state.sessions.len().await, 1);

        let posted = app.oneshot(post_message(endpoint, r#"{"ping":1}"#)).await.unwrap();
        assert_eq!(posted.status(), StatusCode::ACCEPTED);

        let echoed = next_data(&mut body, |l| l.contains("ping")).await;
        let echoed: serde_json::Value = serde_json::from_str(&echoed).unwrap();
        assert_eq!(echoed, json!({"ping": 1}));
    }

    fn stdio_request() -> Request<Body> {
        authed(Request::get("/stdio?transportType=stdio&command=my-server&args=--verbose"))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn stdio_session_relays_through_the_bridge() {
        // The bridge child just sleeps; the echo server stands in for what
        // it would serve on the bridge port.
        let upstream = echo_upstream().await;
        let mut config = Config::default();
        config.bridge.program = "sleep".to_string();
        config.bridge.args = vec!["30".to_string()];
        config.bridge.host = "127.0.0.1".to_string();
        config.bridge.port = upstream.port();
        config.bridge.ready_attempts = 5;
        config.bridge.ready_interval_ms = 20;
        config.bridge.probe_timeout_ms = 200;
        let state = state_with(config);
        let app = router(state.clone());

        let response = app.clone().oneshot(stdio_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();

        let endpoint = next_data(&mut body, |_| true).await;
        assert!(endpoint.starts_with("/message?sessionId="));
        let session = endpoint.trim_start_matches("/message?sessionId=").to_string();
        let pair = state.sessions.get(&session).await.unwrap();
        assert_eq!(pair.server.kind.as_str(), "stdio");

        let posted = app
            .clone()
            .oneshot(post_message(endpoint, r#"{"ping":1}"#))
            .await
            .unwrap();
        assert_eq!(posted.status(), StatusCode::ACCEPTED);
        let echoed = next_data(&mut body, |l| l.contains("ping")).await;
        let echoed: serde_json::Value = serde_json::from_str(&echoed).unwrap();
        assert_eq!(echoed, json!({"ping": 1}));

        // The bridge port belongs to this session until it ends.
        let second = app.oneshot(stdio_request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams_and_clears_sessions() {
        let upstream = echo_upstream().await;
        let state = state();
        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, triggered) = tokio::sync::oneshot::channel::<()>();
        let shutdown_state = state.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = triggered.await;
                    shutdown_state.shutdown().await;
                })
                .await
                .unwrap();
        });

        let response = reqwest::Client::new()
            .get(format!(
                "http://{addr}/sse?transportType=sse&url=http://{upstream}/sse"
            ))
            .header(crate::auth::TOKEN_HEADER, format!("Bearer {TOKEN}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let mut body = Box::pin(response.bytes_stream());
        next_data(&mut body, |_| true).await;
        assert_eq!(state.sessions.len().await, 1);

        trigger.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("server still draining after shutdown")
            .unwrap();
        assert!(state.sessions.is_empty().await);
    }
}
