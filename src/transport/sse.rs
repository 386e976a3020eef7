//! Legacy SSE transport, both directions.
//!
//! - [`connect`] is the server-facing client. `GET <url>` opens an event stream
//!   whose first `endpoint` event names the URL to `POST` messages to;
//!   subsequent `message` events carry server messages.
//! - [`SseServerTransport`] is the client-facing mirror image, served on
//!   `GET /sse` / `GET /stdio` with messages arriving on
//!   `POST /message?sessionId=<id>`.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use eventsource_stream::{Event as SseEvent, EventStreamError, Eventsource};
use futures::stream::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{
    link, request_id, wait_closed, Closer, LinkDriver, Message, TransportError, TransportEvent,
    TransportLink, LINK_CAPACITY,
};

/// Whether a decoded event carries a message. A missing `event:` field means
/// the default `message` type.
pub fn is_message(event: &SseEvent) -> bool {
    event.event.is_empty() || event.event == "message"
}

/// Map a decoding failure on a response body.
pub fn stream_error(e: EventStreamError<reqwest::Error>) -> TransportError {
    match e {
        EventStreamError::Transport(e) => TransportError::from_reqwest(&e),
        other => TransportError::Request(other.to_string()),
    }
}

/// Connect to a remote SSE endpoint and wait for its `endpoint` event.
///
/// Non-2xx responses fail with [`TransportError::Upstream`] carrying the
/// status, so a `401` can be reported to the caller as-is.
pub async fn connect(
    http: &reqwest::Client,
    url: Url,
    headers: HeaderMap,
) -> Result<TransportLink, TransportError> {
    let response = http
        .get(url.clone())
        .headers(headers.clone())
        .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
        .send()
        .await
        .map_err(|e| TransportError::from_reqwest(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    let (transport_link, driver) = link(LINK_CAPACITY);
    let LinkDriver {
        outbound,
        events,
        shutdown,
        ..
    } = driver;

    let (endpoint_tx, endpoint_rx) = oneshot::channel();
    tokio::spawn(read_stream(
        response,
        url,
        events.clone(),
        shutdown.clone(),
        endpoint_tx,
    ));

    let endpoint = endpoint_rx.await.map_err(|_| TransportError::NoEndpoint)??;
    debug!(endpoint = %endpoint, "SSE endpoint received");

    tokio::spawn(write_messages(
        http.clone(),
        endpoint,
        headers,
        outbound,
        events,
        shutdown,
    ));

    Ok(transport_link)
}

/// Pump the event stream into `events`, handing the first `endpoint` event to
/// `endpoint_tx`.
async fn read_stream(
    response: reqwest::Response,
    base: Url,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    endpoint_tx: oneshot::Sender<Result<Url, TransportError>>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = Box::pin(response.bytes_stream().eventsource());

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            () = wait_closed(&mut shutdown) => return,
        };
        match next {
            Some(Ok(event)) if event.event == "endpoint" => {
                let resolved = resolve_endpoint(&base, &event.data);
                match endpoint_tx.take() {
                    Some(tx) => {
                        let failed = resolved.is_err();
                        let _ = tx.send(resolved);
                        if failed {
                            return;
                        }
                    }
                    None => debug!("Ignoring repeated endpoint event"),
                }
            }
            Some(Ok(event)) if is_message(&event) => {
                match serde_json::from_str::<Message>(&event.data) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping unparseable SSE message: {e}"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let e = stream_error(e);
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(Err(e));
                    return;
                }
                let _ = events.send(TransportEvent::Error(format!("SSE stream error: {e}"))).await;
                return;
            }
            None => {
                if endpoint_tx.is_none() {
                    let _ = events.send(TransportEvent::Closed).await;
                }
                return;
            }
        }
    }
}

/// The endpoint must stay on the stream's origin.
fn resolve_endpoint(base: &Url, data: &str) -> Result<Url, TransportError> {
    let endpoint = base.join(data.trim()).map_err(|e| TransportError::InvalidUrl {
        url: data.to_string(),
        reason: e.to_string(),
    })?;
    if endpoint.origin() != base.origin() {
        return Err(TransportError::InvalidUrl {
            url: endpoint.to_string(),
            reason: format!(
                "endpoint origin does not match {}",
                base.origin().ascii_serialization()
            ),
        });
    }
    Ok(endpoint)
}

/// POST each outbound message, in order, to the endpoint.
async fn write_messages(
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    mut outbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(m) => m,
                None => return,
            },
            () = wait_closed(&mut shutdown) => return,
        };
        let result = http
            .post(endpoint.clone())
            .headers(headers.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(&message)
            .send()
            .await;
        let error = match result {
            Ok(resp) if resp.status().is_success() => continue,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                format!("Error POSTing to endpoint (HTTP {status}): {body}")
            }
            Err(e) => format!("Error POSTing to endpoint: {e}"),
        };
        warn!("{error}");
        let id = request_id(&message).cloned();
        if events.send(TransportEvent::SendFailed { id, error }).await.is_err() {
            return;
        }
    }
}

/// Boxed SSE body handed to axum.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Client-facing SSE transport.
pub struct SseServerTransport;

/// Request-layer handle for delivering `POST /message` bodies.
#[derive(Clone)]
pub struct SseServerHandle {
    session_id: String,
    inbound: mpsc::Sender<TransportEvent>,
}

impl SseServerTransport {
    /// Create a transport whose message endpoint is `<endpoint>?sessionId=<id>`.
    ///
    /// Returns the request-layer handle, the relay-side link, and the event
    /// stream to serve as the response body. Dropping the stream (client
    /// disconnect) hangs up the link, which then reports
    /// [`TransportEvent::Closed`].
    pub fn open(endpoint: &str) -> (SseServerHandle, TransportLink, EventStream) {
        let session_id = Uuid::new_v4().to_string();
        let (transport_link, driver) = link(LINK_CAPACITY);
        let LinkDriver {
            outbound,
            events,
            shutdown,
            hangup,
        } = driver;

        let endpoint_event = Event::default()
            .event("endpoint")
            .data(format!("{endpoint}?sessionId={session_id}"));
        let body = outbound_stream(Some(endpoint_event), outbound, shutdown);
        let stream = NotifyOnEnd {
            inner: body,
            hangup,
        };

        let handle = SseServerHandle {
            session_id,
            inbound: events,
        };
        (handle, transport_link, Box::pin(stream))
    }
}

impl SseServerHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deliver one message posted by the client.
    pub async fn post(&self, message: Message) -> Result<(), TransportError> {
        self.inbound
            .send(TransportEvent::Message(message))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Stream `message` events from `outbound` until it closes or `shutdown`
/// fires. Queued messages are flushed before shutdown is honoured.
pub fn outbound_stream(
    first: Option<Event>,
    outbound: mpsc::Receiver<Message>,
    shutdown: watch::Receiver<bool>,
) -> EventStream {
    let stream = futures::stream::unfold(
        (first, outbound, shutdown),
        |(mut first, mut outbound, mut shutdown)| async move {
            if let Some(event) = first.take() {
                return Some((Ok(event), (first, outbound, shutdown)));
            }
            let message = tokio::select! {
                biased;
                message = outbound.recv() => message?,
                () = wait_closed(&mut shutdown) => return None,
            };
            Some((Ok(message_event(&message)), (first, outbound, shutdown)))
        },
    );
    Box::pin(stream)
}

/// `event: message` carrying the serialized payload.
pub fn message_event(message: &Message) -> Event {
    Event::default()
        .event("message")
        .data(serde_json::to_string(message).unwrap_or_default())
}

/// Wrapper that hangs up the link when the stream ends or is dropped by a
/// disconnecting client.
struct NotifyOnEnd {
    inner: EventStream,
    hangup: Closer,
}

impl Stream for NotifyOnEnd {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(None) = &result {
            self.hangup.close();
        }
        result
    }
}

impl Drop for NotifyOnEnd {
    fn drop(&mut self) {
        self.hangup.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        response::{sse::Sse, IntoResponse},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[test]
    fn endpoint_must_share_origin() {
        let base = Url::parse("http://localhost:8742/sse").unwrap();
        let ok = resolve_endpoint(&base, "/message?sessionId=abc").unwrap();
        assert_eq!(ok.as_str(), "http://localhost:8742/message?sessionId=abc");
        assert!(resolve_endpoint(&base, "http://evil.example/message").is_err());
    }

    #[tokio::test]
    async fn server_transport_emits_endpoint_then_messages() {
        let (handle, transport_link, mut stream) = SseServerTransport::open("/message");
        transport_link.send(json!({"id": 1})).await.unwrap();
        transport_link.send(json!({"id": 2})).await.unwrap();
        transport_link.close();

        let mut count = 0;
        while let Some(Ok(_event)) = stream.next().await {
            count += 1;
        }
        // endpoint + two queued messages flushed before close
        assert_eq!(count, 3);
        assert!(!handle.session_id().is_empty());
    }

    #[tokio::test]
    async fn dropping_server_stream_reports_closed() {
        let (handle, mut transport_link, stream) = SseServerTransport::open("/message");
        handle.post(json!({"method": "ping"})).await.unwrap();
        drop(stream);
        assert!(matches!(transport_link.recv().await, Some(TransportEvent::Message(_))));
        assert!(matches!(transport_link.recv().await, Some(TransportEvent::Closed)));
    }

    #[tokio::test]
    async fn disconnect_is_reported_even_with_a_full_queue() {
        let (handle, mut transport_link, stream) = SseServerTransport::open("/message");
        for n in 0..LINK_CAPACITY {
            handle.post(json!({"n": n})).await.unwrap();
        }
        drop(stream);
        for _ in 0..LINK_CAPACITY {
            assert!(matches!(transport_link.recv().await, Some(TransportEvent::Message(_))));
        }
        assert!(matches!(transport_link.recv().await, Some(TransportEvent::Closed)));
    }

    type Posted = Arc<Mutex<Vec<Message>>>;

    /// Minimal upstream: `/sse` announces `/message`, `/message` records bodies.
    async fn fake_upstream(posted: Posted) -> Url {
        let app = Router::new()
            .route(
                "/sse",
                get(|| async {
                    let (_handle, transport_link, stream) = SseServerTransport::open("/message");
                    transport_link
                        .send(json!({"jsonrpc": "2.0", "method": "hello"}))
                        .await
                        .unwrap();
                    // Keep the link alive for the lifetime of the stream.
                    let stream = stream.map(move |item| {
                        let _keep = &transport_link;
                        item
                    });
                    Sse::new(stream).into_response()
                }),
            )
            .route(
                "/message",
                post(|State(posted): State<Posted>, Json(body): Json<Message>| async move {
                    posted.lock().await.push(body);
                    axum::http::StatusCode::ACCEPTED
                }),
            )
            .with_state(posted);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Url::parse(&format!("http://{addr}/sse")).unwrap()
    }

    #[tokio::test]
    async fn client_receives_messages_and_posts_in_order() {
        let posted = Posted::default();
        let url = fake_upstream(posted.clone()).await;
        let mut client = connect(&reqwest::Client::new(), url, HeaderMap::new())
            .await
            .unwrap();

        match client.recv().await {
            Some(TransportEvent::Message(m)) => assert_eq!(m["method"], "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        for n in 1..=3 {
            client.send(json!({"n": n})).await.unwrap();
        }
        for _ in 0..50 {
            if posted.lock().await.len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let got: Vec<i64> = posted
            .lock()
            .await
            .iter()
            .map(|m| m["n"].as_i64().unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        client.close();
    }

    /// Upstream whose message event arrives in two writes, split inside a
    /// multi-byte character.
    async fn split_utf8_upstream() -> Url {
        use axum::body::{Body, Bytes};
        use std::time::Duration;

        let app = Router::new().route(
            "/sse",
            get(|| async {
                let payload = "data: {\"t\":\"\u{e9}\"}\n\n".as_bytes().to_vec();
                let split = payload.iter().position(|b| *b == 0xc3).unwrap() + 1;
                let chunks = vec![
                    Bytes::from_static(b"event: endpoint\ndata: /message\n\n"),
                    Bytes::from(payload[..split].to_vec()),
                    Bytes::from(payload[split..].to_vec()),
                ];
                let body = futures::stream::iter(chunks).then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Infallible>(chunk)
                });
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(body),
                )
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Url::parse(&format!("http://{addr}/sse")).unwrap()
    }

    #[tokio::test]
    async fn characters_split_across_writes_arrive_intact() {
        let url = split_utf8_upstream().await;
        let mut client = connect(&reqwest::Client::new(), url, HeaderMap::new())
            .await
            .unwrap();
        match client.recv().await {
            Some(TransportEvent::Message(m)) => assert_eq!(m["t"], "\u{e9}"),
            other => panic!("unexpected event: {other:?}"),
        }
        client.close();
    }

    #[tokio::test]
    async fn client_reports_upstream_status() {
        let app = Router::new().route(
            "/sse",
            get(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let url = Url::parse(&format!("http://{addr}/sse")).unwrap();
        let err = connect(&reqwest::Client::new(), url, HeaderMap::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
