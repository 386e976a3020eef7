//! Transport links: the bidirectional channel capability every session side
//! is built from.
//!
//! A transport is split in two halves:
//!
//! - [`TransportLink`] is held by the relay. It sends messages, receives
//!   [`TransportEvent`]s and closes the transport.
//! - [`LinkDriver`] is held by the transport's own I/O tasks, which drain
//!   outbound messages onto the wire and publish inbound events.
//!
//! Messages are opaque JSON-RPC payloads relayed verbatim.
//!
//! ```text
//!   relay ──send──▶ outbound mpsc ──▶ driver task ──▶ wire
//!   relay ◀──recv── events mpsc   ◀── driver task ◀── wire
//!   close() ──▶ watch<bool> ──▶ driver tasks stop
//!   hangup  ──▶ watch<bool> ──▶ relay sees Closed after queued events
//! ```

pub mod sse;
pub mod streamable;

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

/// One opaque JSON-RPC message.
pub type Message = Value;

/// Default depth of the outbound and event queues.
pub const LINK_CAPACITY: usize = 256;

/// Something a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived from the far side.
    Message(Message),
    /// The client-facing side assigned its session id (streamable HTTP only).
    Initialized(String),
    /// An outbound message could not be delivered. `id` is set when the
    /// message was a request, so the caller can be answered with an error.
    SendFailed { id: Option<Value>, error: String },
    /// The transport failed and can't continue.
    Error(String),
    /// The far side went away.
    Closed,
}

/// Transport kind requested through `?transportType=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Local command bridged to SSE by a supervised process.
    Stdio,
    /// Remote legacy SSE endpoint.
    Sse,
    /// Remote streamable-HTTP endpoint.
    StreamableHttp,
}

impl TransportKind {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        match raw {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamable-http" => Ok(Self::StreamableHttp),
            other => Err(TransportError::UnknownKind(other.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

/// Errors from building or running a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid transport type specified: {0}")]
    UnknownKind(String),
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Invalid env parameter: {0}")]
    InvalidEnv(String),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Supergateway failed to start on port {port} after {attempts} attempts")]
    BridgeTimeout { port: u16, attempts: u32 },
    #[error("Bridge port {port} is already serving another stdio session")]
    BridgeBusy { port: u16 },
    #[error("Bridge process exited before listening ({status})")]
    BridgeExited { status: String },
    #[error("Upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("Connection refused. Is the MCP server running? ({0})")]
    ConnectionRefused(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Stream ended before the endpoint event was received")]
    NoEndpoint,
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// HTTP status to answer the inbound request with.
    ///
    /// Upstream `401` and `404` pass through unchanged so callers can react to
    /// auth failures and missing endpoints.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownKind(_)
            | Self::MissingParameter(_)
            | Self::InvalidUrl { .. }
            | Self::InvalidArgs(_)
            | Self::InvalidEnv(_) => StatusCode::BAD_REQUEST,
            Self::BridgeBusy { .. } => StatusCode::CONFLICT,
            Self::Upstream { status: 401, .. } => StatusCode::UNAUTHORIZED,
            Self::Upstream { status: 404, .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a reqwest failure, singling out refused connections.
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_connect() {
            Self::ConnectionRefused(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Cloneable handle that closes a transport.
#[derive(Clone)]
pub struct Closer(Arc<watch::Sender<bool>>);

impl Closer {
    /// Signal the transport to stop. Idempotent.
    pub fn close(&self) {
        self.0.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once [`Closer::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.0.subscribe();
        wait_closed(&mut rx).await;
    }
}

/// Relay-side half of a transport.
pub struct TransportLink {
    outbound: mpsc::Sender<Message>,
    events: mpsc::Receiver<TransportEvent>,
    closer: Closer,
    hangup: watch::Receiver<bool>,
}

/// Transport-side half of a link.
pub struct LinkDriver {
    pub outbound: mpsc::Receiver<Message>,
    pub events: mpsc::Sender<TransportEvent>,
    pub shutdown: watch::Receiver<bool>,
    /// Reports that the far side went away without going through the
    /// bounded event queue.
    pub hangup: Closer,
}

/// Create a connected link/driver pair.
pub fn link(capacity: usize) -> (TransportLink, LinkDriver) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (ev_tx, ev_rx) = mpsc::channel(capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (hangup_tx, hangup_rx) = watch::channel(false);
    (
        TransportLink {
            outbound: out_tx,
            events: ev_rx,
            closer: Closer(Arc::new(shutdown_tx)),
            hangup: hangup_rx,
        },
        LinkDriver {
            outbound: out_rx,
            events: ev_tx,
            shutdown: shutdown_rx,
            hangup: Closer(Arc::new(hangup_tx)),
        },
    )
}

impl TransportLink {
    /// Queue a message for the far side.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.closer.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next event; `None` once every driver task has gone. Queued events
    /// are delivered before a hangup is reported as [`TransportEvent::Closed`].
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        let hangup = &mut self.hangup;
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            () = hung_up(hangup) => Some(TransportEvent::Closed),
        }
    }

    pub fn close(&self) {
        self.closer.close();
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }
}

/// Resolve once `shutdown` flips to `true` or its sender is dropped.
pub async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve once `hangup` is set. A driver that dropped its sender without
/// hanging up never resolves this.
async fn hung_up(hangup: &mut watch::Receiver<bool>) {
    let gone = hangup.wait_for(|gone| *gone).await.is_ok();
    if !gone {
        std::future::pending::<()>().await;
    }
}

/// The JSON-RPC `id` of a request, if `message` is one.
pub fn request_id(message: &Message) -> Option<&Value> {
    if message.get("method").is_some() {
        message.get("id").filter(|id| !id.is_null())
    } else {
        None
    }
}

/// Whether `message` is a response (`result` or `error` with an `id`).
pub fn is_response(message: &Message) -> bool {
    message.get("method").is_none()
        && message.get("id").is_some()
        && (message.get("result").is_some() || message.get("error").is_some())
}

/// JSON-RPC error response for a request that couldn't be forwarded.
pub fn error_response(id: &Value, message: &str) -> Message {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": -32001,
            "message": message,
        },
    })
}

/// `notifications/stderr` wrapper for a diagnostic line.
pub fn stderr_notification(content: &str) -> Message {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/stderr",
        "params": {
            "content": content,
        },
    })
}
