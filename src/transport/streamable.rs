//! Streamable-HTTP transport, both directions.
//!
//! - [`StreamableHttpClient`] (server-facing): every outbound message is a
//!   `POST` whose response is `202`, a JSON body, or an event stream of
//!   replies. POSTs are issued in order but each one completes on its own
//!   task, so a slow request never holds back a later cancellation. The
//!   `mcp-session-id` returned by the server is echoed on every later
//!   request, and `terminate_session` ends it with `DELETE`.
//! - [`StreamableServerTransport`] (client-facing) is served on `/mcp`. The
//!   session id is minted when the client's `initialize` request arrives and
//!   announced to the relay as [`TransportEvent::Initialized`]. Responses are
//!   routed back to the `POST` that carried the matching request; everything
//!   else goes to the optional standalone `GET` stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use axum::{
    http::{header, HeaderMap as AxumHeaderMap, HeaderValue as AxumHeaderValue, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    Json,
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::sse::{is_message, message_event, outbound_stream};
use super::{
    is_response, link, request_id, wait_closed, LinkDriver, Message, TransportError,
    TransportEvent, TransportLink, LINK_CAPACITY,
};

/// Header carrying the streamable-HTTP session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Server-facing streamable-HTTP client.
pub struct StreamableHttpClient {
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
}

impl StreamableHttpClient {
    /// Build the client and its link. Nothing is sent until the first message.
    pub fn start(
        http: reqwest::Client,
        url: Url,
        headers: HeaderMap,
    ) -> (TransportLink, Arc<StreamableHttpClient>) {
        let client = Arc::new(Self {
            http,
            url,
            headers,
            session_id: Mutex::new(None),
        });
        let (transport_link, driver) = link(LINK_CAPACITY);
        tokio::spawn(Arc::clone(&client).drive(driver));
        (transport_link, client)
    }

    /// Session id assigned by the remote server, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(id) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&id) {
                headers.insert(HeaderName::from_static(SESSION_HEADER), value);
            }
        }
        headers
    }

    fn remember_session(&self, headers: &HeaderMap) {
        let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = Some(id.to_string());
        }
    }

    async fn drive(self: Arc<Self>, driver: LinkDriver) {
        let LinkDriver {
            mut outbound,
            events,
            mut shutdown,
            ..
        } = driver;
        loop {
            let message = tokio::select! {
                message = outbound.recv() => match message {
                    Some(m) => m,
                    None => return,
                },
                () = wait_closed(&mut shutdown) => return,
            };
            let client = Arc::clone(&self);
            let events = events.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stop = shutdown.clone();
                tokio::select! {
                    () = client.deliver(message, &events, &shutdown) => {}
                    () = wait_closed(&mut stop) => {}
                }
            });
        }
    }

    /// POST one message and publish its outcome.
    async fn deliver(
        &self,
        message: Message,
        events: &mpsc::Sender<TransportEvent>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let Err(error) = self.post(&message, events, shutdown).await else {
            return;
        };
        warn!("{error}");
        let failed = TransportEvent::SendFailed {
            id: request_id(&message).cloned(),
            error: error.to_string(),
        };
        let _ = events.send(failed).await;
    }

    async fn post(
        &self,
        message: &Message,
        events: &mpsc::Sender<TransportEvent>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, HeaderValue::from_static(ACCEPT_BOTH))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        self.remember_session(response.headers());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        if status == reqwest::StatusCode::ACCEPTED {
            if message.get("method").and_then(Value::as_str) == Some("notifications/initialized") {
                self.open_standalone_stream(events.clone(), shutdown.clone());
            }
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type.starts_with("text/event-stream") {
            pump_event_stream(response, events.clone(), shutdown.clone()).await;
        } else if content_type.starts_with("application/json") {
            let body: Value = response
                .json()
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;
            let messages = match body {
                Value::Array(items) => items,
                single => vec![single],
            };
            for m in messages {
                events
                    .send(TransportEvent::Message(m))
                    .await
                    .map_err(|_| TransportError::Closed)?;
            }
        } else {
            return Err(TransportError::Request(format!(
                "Unexpected content type: {content_type}"
            )));
        }
        Ok(())
    }

    /// Optional `GET` stream for server-initiated messages. `405` means the
    /// server doesn't offer one.
    fn open_standalone_stream(
        &self,
        events: mpsc::Sender<TransportEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        let request = self
            .http
            .get(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    pump_event_stream(resp, events, shutdown).await;
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                    debug!("Server offers no standalone SSE stream");
                }
                Ok(resp) => warn!("Standalone SSE stream rejected: HTTP {}", resp.status()),
                Err(e) => warn!("Standalone SSE stream failed: {e}"),
            }
        });
    }

    /// Ask the remote server to end the session (`DELETE`). A `405` means
    /// the server doesn't support explicit termination and is not an error.
    pub async fn terminate_session(&self) -> Result<(), TransportError> {
        if self.session_id().is_none() {
            return Ok(());
        }
        let response = self
            .http
            .delete(self.url.clone())
            .headers(self.request_headers())
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            if let Ok(mut slot) = self.session_id.lock() {
                *slot = None;
            }
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Upstream {
            status: status.as_u16(),
            body,
        })
    }
}

async fn pump_event_stream(
    response: reqwest::Response,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = Box::pin(response.bytes_stream().eventsource());
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            () = wait_closed(&mut shutdown) => return,
        };
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!("Streamable HTTP response stream error: {e}");
                return;
            }
            None => return,
        };
        if !is_message(&event) || event.data.is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&event.data) {
            Ok(m) => {
                if events.send(TransportEvent::Message(m)).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Dropping unparseable SSE message: {e}"),
        }
    }
}

/// Client-facing streamable-HTTP transport.
pub struct StreamableServerTransport;

/// Request-layer handle shared by every `/mcp` request of one session.
#[derive(Clone)]
pub struct StreamableServerHandle {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    session_id: OnceLock<String>,
    inbound: mpsc::Sender<TransportEvent>,
    routes: Mutex<Routes>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Default)]
struct Routes {
    /// Request id (serialized) → the POST stream awaiting its response.
    pending: HashMap<String, mpsc::Sender<Message>>,
    standalone: Option<mpsc::Sender<Message>>,
}

impl StreamableServerTransport {
    pub fn open() -> (StreamableServerHandle, TransportLink) {
        let (transport_link, driver) = link(LINK_CAPACITY);
        let LinkDriver {
            outbound,
            events,
            shutdown,
            ..
        } = driver;
        let handle = StreamableServerHandle {
            inner: Arc::new(ServerInner {
                session_id: OnceLock::new(),
                inbound: events,
                routes: Mutex::new(Routes::default()),
                shutdown: shutdown.clone(),
            }),
        };
        tokio::spawn(route_outbound(handle.clone(), outbound, shutdown));
        (handle, transport_link)
    }
}

/// Deliver relay output to the POST stream or standalone stream it belongs to.
async fn route_outbound(
    handle: StreamableServerHandle,
    mut outbound: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(m) => m,
                None => break,
            },
            () = wait_closed(&mut shutdown) => break,
        };
        let target = handle.take_route(&message);
        match target {
            Some(tx) => {
                let _ = tx.send(message).await;
            }
            None => debug!("No open stream for server message; dropped"),
        }
    }
    if let Ok(mut routes) = handle.inner.routes.lock() {
        routes.pending.clear();
        routes.standalone = None;
    }
}

impl StreamableServerHandle {
    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.get().map(String::as_str)
    }

    /// Responses consume their pending route; other messages use the
    /// standalone stream if one is open.
    fn take_route(&self, message: &Message) -> Option<mpsc::Sender<Message>> {
        let mut routes = self.inner.routes.lock().ok()?;
        if is_response(message) {
            let key = message.get("id").map(Value::to_string)?;
            return routes.pending.remove(&key);
        }
        match &routes.standalone {
            Some(tx) if !tx.is_closed() => Some(tx.clone()),
            Some(_) => {
                routes.standalone = None;
                None
            }
            None => None,
        }
    }

    /// Handle one `POST /mcp` body.
    pub async fn handle_post(&self, headers: &AxumHeaderMap, body: &[u8]) -> Response {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !(accept.contains("application/json") && accept.contains("text/event-stream")) {
            return rpc_error(
                StatusCode::NOT_ACCEPTABLE,
                -32000,
                "Not Acceptable: Client must accept both application/json and text/event-stream",
            );
        }
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.contains("application/json") {
            return rpc_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                -32000,
                "Unsupported Media Type: Content-Type must be application/json",
            );
        }

        let messages = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Array(items)) => items,
            Ok(single) => vec![single],
            Err(_) => return rpc_error(StatusCode::BAD_REQUEST, -32700, "Parse error"),
        };

        let initializing = messages
            .iter()
            .any(|m| m.get("method").and_then(Value::as_str) == Some("initialize"));
        if initializing {
            if self.session_id().is_some() {
                return rpc_error(
                    StatusCode::BAD_REQUEST,
                    -32600,
                    "Invalid Request: Server already initialized",
                );
            }
            if messages.len() > 1 {
                return rpc_error(
                    StatusCode::BAD_REQUEST,
                    -32600,
                    "Invalid Request: Only one initialization request is allowed",
                );
            }
            let id = Uuid::new_v4().to_string();
            let id = self.inner.session_id.get_or_init(|| id).clone();
            if self
                .inner
                .inbound
                .send(TransportEvent::Initialized(id))
                .await
                .is_err()
            {
                return closed_response();
            }
        } else if self.session_id().is_none() {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                -32000,
                "Bad Request: Server not initialized",
            );
        }

        let request_ids: Vec<String> = messages
            .iter()
            .filter_map(|m| request_id(m).map(Value::to_string))
            .collect();

        if request_ids.is_empty() {
            for m in messages {
                if self.inner.inbound.send(TransportEvent::Message(m)).await.is_err() {
                    return closed_response();
                }
            }
            return self.with_session_header(StatusCode::ACCEPTED.into_response());
        }

        let (tx, rx) = mpsc::channel(request_ids.len().max(1));
        if let Ok(mut routes) = self.inner.routes.lock() {
            for id in request_ids {
                routes.pending.insert(id, tx.clone());
            }
        }
        // The stream ends once every pending route has been answered.
        drop(tx);

        for m in messages {
            if self.inner.inbound.send(TransportEvent::Message(m)).await.is_err() {
                return closed_response();
            }
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            let message = rx.recv().await?;
            Some((Ok::<_, std::convert::Infallible>(message_event(&message)), rx))
        });
        self.with_session_header(Sse::new(stream).into_response())
    }

    /// Handle `GET /mcp`: open the standalone stream for server-initiated
    /// messages. Only one may be open at a time.
    pub fn handle_get(&self) -> Response {
        let (tx, rx) = mpsc::channel(LINK_CAPACITY);
        {
            let Ok(mut routes) = self.inner.routes.lock() else {
                return closed_response();
            };
            if routes.standalone.as_ref().is_some_and(|s| !s.is_closed()) {
                return rpc_error(
                    StatusCode::CONFLICT,
                    -32000,
                    "Conflict: Only one SSE stream is allowed per session",
                );
            }
            routes.standalone = Some(tx);
        }
        let stream = outbound_stream(None, rx, self.inner.shutdown.clone());
        self.with_session_header(Sse::new(stream).into_response())
    }

    fn with_session_header(&self, mut response: Response) -> Response {
        if let Some(id) = self.session_id() {
            if let Ok(value) = AxumHeaderValue::from_str(id) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
        }
        response
    }
}

fn rpc_error(status: StatusCode, code: i64, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {"code": code, "message": message},
            "id": null,
        })),
    )
        .into_response()
}

fn closed_response() -> Response {
    rpc_error(StatusCode::NOT_FOUND, -32001, "Session closed")
}
