//! Message pump between the two transports of one session.
//!
//! Exactly one relay task owns a pair. It forwards every message verbatim,
//! in arrival order per direction, and tears the pair down when either side
//! closes or fails:
//!
//! ```text
//!   client link ──Message──▶ server link
//!   client link ◀──Message── server link
//!   client link ◀──notifications/stderr── bridge stderr (stdio only)
//! ```
//!
//! Teardown removes the registry entry, closes both links and kills the
//! bridge process. A bridge stderr chunk containing `MODULE_NOT_FOUND` means
//! the user's command can't start: the client is told so before teardown.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::BridgeProcess;
use crate::factory::ServerTransport;
use crate::sessions::{ClientHandle, ServerControl, SessionPair, SessionRegistry};
use crate::transport::{error_response, stderr_notification, TransportEvent, TransportLink};

/// Stderr marker of a command that could not be found.
const FATAL_STDERR_MARKER: &str = "MODULE_NOT_FOUND";

/// Notification text sent to the client before a fatal teardown.
pub const COMMAND_NOT_FOUND: &str = "Command not found, transports removed";

/// Why a relay stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    ClientClosed,
    ServerClosed,
    ClientError(String),
    ServerError(String),
    /// The registry entry was removed, or a closer fired, from outside.
    Terminated,
    /// The bridge reported that the user's command doesn't exist.
    CommandNotFound,
}

/// Client-facing half handed to the relay.
pub struct ClientSide {
    pub link: TransportLink,
    pub handle: ClientHandle,
}

/// Register the pair where possible, then run the relay on its own task.
///
/// SSE sessions are in the registry by the time this returns, so the client
/// can `POST /message` as soon as it sees the endpoint event.
pub async fn spawn(
    registry: SessionRegistry,
    client: ClientSide,
    server: ServerTransport,
) -> JoinHandle<RelayExit> {
    let relay = Relay::register(registry, client, server).await;
    tokio::spawn(relay.pump())
}

struct Relay {
    registry: SessionRegistry,
    client_link: TransportLink,
    server_link: TransportLink,
    bridge: Option<BridgeProcess>,
    diagnostics: Option<mpsc::Receiver<String>>,
    pair: SessionPair,
    session_id: Option<String>,
}

impl Relay {
    async fn register(
        registry: SessionRegistry,
        client: ClientSide,
        server: ServerTransport,
    ) -> Self {
        let kind = server.kind();
        let (server_link, bridge, diagnostics, remote) = match server {
            ServerTransport::Stdio {
                link,
                bridge,
                diagnostics,
            } => (link, Some(bridge), Some(diagnostics), None),
            ServerTransport::Sse { link } => (link, None, None, None),
            ServerTransport::StreamableHttp { link, client } => (link, None, None, Some(client)),
        };
        let ClientSide {
            link: client_link,
            handle,
        } = client;

        let pair = SessionPair {
            client: handle.clone(),
            client_closer: client_link.closer(),
            server: ServerControl {
                kind,
                closer: server_link.closer(),
                remote,
            },
            created_at: Instant::now(),
        };

        // SSE sessions are addressable immediately; streamable-HTTP sessions
        // once the client's initialize request has minted an id.
        let mut session_id = None;
        if let ClientHandle::Sse(sse) = &handle {
            let id = sse.session_id().to_string();
            if registry.insert(&id, pair.clone()).await {
                session_id = Some(id);
            }
        }

        Self {
            registry,
            client_link,
            server_link,
            bridge,
            diagnostics,
            pair,
            session_id,
        }
    }

    /// Pump messages until either side ends, then tear the pair down.
    async fn pump(mut self) -> RelayExit {
        // A closed channel would make `recv` ready forever, so track it.
        let (mut diagnostics, mut diag_open) = match self.diagnostics.take() {
            Some(rx) => (rx, true),
            None => (mpsc::channel(1).1, false),
        };
        let client_closer = self.client_link.closer();
        let server_closer = self.server_link.closer();
        let client_link = &mut self.client_link;
        let server_link = &mut self.server_link;
        let registry = &self.registry;
        let pair = &self.pair;
        let session_id = &mut self.session_id;

        let exit = loop {
            tokio::select! {
                event = client_link.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        if let Err(e) = server_link.send(message).await {
                            break RelayExit::ServerError(e.to_string());
                        }
                    }
                    Some(TransportEvent::Initialized(id)) => {
                        if registry.insert(&id, pair.clone()).await {
                            info!(session = %id, "Client <-> Proxy session initialized");
                            *session_id = Some(id);
                        } else {
                            warn!(session = %id, "Session id already registered");
                        }
                    }
                    Some(TransportEvent::SendFailed { error, .. }) => {
                        warn!("Failed to deliver message to client: {error}");
                    }
                    Some(TransportEvent::Error(e)) => break RelayExit::ClientError(e),
                    Some(TransportEvent::Closed) | None => break RelayExit::ClientClosed,
                },
                event = server_link.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        if let Err(e) = client_link.send(message).await {
                            break RelayExit::ClientError(e.to_string());
                        }
                    }
                    Some(TransportEvent::SendFailed { id: Some(id), error }) => {
                        // Answer the request so the client isn't left waiting.
                        if let Err(e) = client_link.send(error_response(&id, &error)).await {
                            break RelayExit::ClientError(e.to_string());
                        }
                    }
                    Some(TransportEvent::SendFailed { id: None, error }) => {
                        warn!("Failed to deliver notification to server: {error}");
                    }
                    Some(TransportEvent::Initialized(_)) => {}
                    Some(TransportEvent::Error(e)) => break RelayExit::ServerError(e),
                    Some(TransportEvent::Closed) | None => break RelayExit::ServerClosed,
                },
                chunk = diagnostics.recv(), if diag_open => match chunk {
                    Some(text) if text.contains(FATAL_STDERR_MARKER) => {
                        warn!("Bridge reported a missing command");
                        let _ = client_link.send(stderr_notification(COMMAND_NOT_FOUND)).await;
                        break RelayExit::CommandNotFound;
                    }
                    Some(text) => {
                        debug!(stderr = %text.trim_end(), "Bridge stderr");
                        if let Err(e) = client_link.send(stderr_notification(&text)).await {
                            break RelayExit::ClientError(e.to_string());
                        }
                    }
                    None => diag_open = false,
                },
                () = client_closer.closed() => break RelayExit::Terminated,
                () = server_closer.closed() => break RelayExit::Terminated,
            }
        };

        self.teardown().await;
        info!(session = ?self.session_id, exit = ?exit, "Relay stopped");
        exit
    }

    async fn teardown(&mut self) {
        if let Some(id) = &self.session_id {
            self.registry.remove(id).await;
        }
        self.client_link.close();
        self.server_link.close();
        if let Some(bridge) = self.bridge.as_mut() {
            debug!(pid = ?bridge.id(), port = bridge.port(), "Stopping bridge");
            bridge.kill().await;
        }
    }
}
