//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;

use tracing::warn;

use crate::auth::{SecurityGate, SessionToken};
use crate::config::Config;
use crate::factory::TransportFactory;
use crate::sessions::SessionRegistry;
use crate::tunnel::TunnelManager;

/// Shared application state for the relay server.
///
/// Everything process-wide lives here rather than in globals, so tests can
/// build independent instances.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Per-process proxy token.
    pub token: SessionToken,
    /// Origin and token checks, shared with the middleware layers.
    pub gate: SecurityGate,
    /// Live client/server transport pairs.
    pub sessions: SessionRegistry,
    /// Builds server-facing transports for connect requests.
    pub factory: Arc<TransportFactory>,
    /// The singleton public tunnel.
    pub tunnel: TunnelManager,
}

impl AppState {
    pub fn new(config: Config, token: SessionToken) -> Self {
        let http = reqwest::Client::new();
        let gate = SecurityGate::new(
            config.security.effective_origins(),
            token.clone(),
            config.security.auth_disabled,
        );
        let factory = TransportFactory::new(http.clone(), config.bridge.clone());
        let tunnel = TunnelManager::new(config.tunnel.clone(), config.bridge.port, http);
        Self {
            config: Arc::new(config),
            token,
            gate,
            sessions: SessionRegistry::new(),
            factory: Arc::new(factory),
            tunnel,
        }
    }

    /// Close every session and stop the tunnel.
    ///
    /// Runs before the HTTP server drains, since open event streams only end
    /// once their sessions are closed.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
        if self.tunnel.status().await.running {
            if let Err(e) = self.tunnel.stop().await {
                warn!("Failed to stop tunnel: {e}");
            }
        }
    }
}
