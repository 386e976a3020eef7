//! Singleton public tunnel (ngrok by default).
//!
//! At most one tunnel process runs per [`TunnelManager`]. `start` picks the
//! local port to expose, spawns the tunnel, then polls the tunnel's local
//! status API for the public URL:
//!
//! ```text
//!   start ─▶ check-and-set slot ─▶ spawn `ngrok http <port>`
//!                                      │
//!         grace 2s, then GET /api/tunnels every 1s (≤ 10s)
//!                                      │
//!            first `https` tunnel ─▶ public URL (+ path)
//! ```
//!
//! | Target                                   | Port            | Public URL        |
//! |------------------------------------------|-----------------|-------------------|
//! | `sse` / `streamable-http` on a loopback URL | the URL's port | base + URL path   |
//! | anything else                            | `port` or bridge | base + `/sse`    |
//!
//! A watcher task owns the child. When the process exits, on its own or via
//! `stop`, the slot is cleared so `status` reports `running: false`.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TunnelConfig;
use crate::util::{expand_template, is_loopback_url, retry, Attempt, RetryError, RetryPolicy};

/// Errors from starting or stopping the tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel is already running")]
    AlreadyRunning,
    #[error("No tunnel is running")]
    NotRunning,
    #[error("{program} command not found. Please install ngrok: https://ngrok.com/download")]
    NotInstalled { program: String },
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Invalid tunnel target URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Ngrok startup timeout")]
    DiscoveryTimeout,
    #[error("Tunnel process exited before reporting a public URL")]
    Exited,
}

impl TunnelError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyRunning => StatusCode::CONFLICT,
            Self::NotRunning | Self::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// What the caller wants exposed. Mirrors the `POST /tunnel/start` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelTarget {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub transport_type: Option<String>,
}

/// A started tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub public_url: String,
    pub local_port: u16,
    pub direct_mapping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub running: bool,
    pub public_url: Option<String>,
}

/// Resolved local side of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Plan {
    port: u16,
    direct: bool,
    /// Path of the target URL in direct mode.
    path: Option<String>,
}

/// Choose the local port and mapping mode for `target`.
fn plan(target: &TunnelTarget, bridge_port: u16) -> Result<Plan, TunnelError> {
    let remote_kind = matches!(
        target.transport_type.as_deref(),
        Some("sse" | "streamable-http")
    );
    if let (true, Some(raw)) = (remote_kind, target.url.as_deref()) {
        let url = Url::parse(raw).map_err(|e| TunnelError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if is_loopback_url(&url) {
            let port = url
                .port_or_known_default()
                .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
            let path = Some(url.path().to_string()).filter(|p| !p.is_empty() && p != "/");
            return Ok(Plan {
                port,
                direct: true,
                path,
            });
        }
    }
    Ok(Plan {
        port: target.port.unwrap_or(bridge_port),
        direct: false,
        path: None,
    })
}

/// One entry of the status API's `tunnels` list.
#[derive(Debug, Deserialize)]
struct ApiTunnel {
    #[serde(default)]
    proto: String,
    #[serde(default)]
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiTunnels {
    #[serde(default)]
    tunnels: Vec<ApiTunnel>,
}

struct Running {
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
    public_url: Option<String>,
}

/// Owner of the process-wide tunnel. Cloneable; clones share the slot.
#[derive(Clone)]
pub struct TunnelManager {
    config: Arc<TunnelConfig>,
    bridge_port: u16,
    http: reqwest::Client,
    slot: Arc<Mutex<Option<Running>>>,
    generation: Arc<AtomicU64>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, bridge_port: u16, http: reqwest::Client) -> Self {
        Self {
            config: Arc::new(config),
            bridge_port,
            http,
            slot: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start the tunnel and wait for its public URL.
    pub async fn start(&self, target: &TunnelTarget) -> Result<TunnelInfo, TunnelError> {
        let plan = plan(target, self.bridge_port)?;
        let generation = {
            let mut slot = self.slot.lock().await;
            if slot.is_some() {
                return Err(TunnelError::AlreadyRunning);
            }
            info!(
                port = plan.port,
                direct = plan.direct,
                "Starting tunnel for {} {}",
                if plan.direct { "direct URL mapping" } else { "port" },
                plan.port
            );
            let child = self.spawn(plan.port)?;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (kill_tx, kill_rx) = oneshot::channel();
            *slot = Some(Running {
                generation,
                kill: Some(kill_tx),
                public_url: None,
            });
            tokio::spawn(watch_process(self.slot.clone(), generation, child, kill_rx));
            generation
        };

        let base = match self.discover(generation).await {
            Ok(base) => base,
            Err(e) => {
                self.kill_generation(generation).await;
                return Err(e);
            }
        };

        let base = base.trim_end_matches('/');
        let public_url = if plan.direct {
            format!("{base}{}", plan.path.as_deref().unwrap_or_default())
        } else {
            format!("{base}{}", self.config.bridge_path)
        };

        {
            let mut slot = self.slot.lock().await;
            match slot.as_mut() {
                Some(running) if running.generation == generation => {
                    running.public_url = Some(public_url.clone());
                }
                _ => return Err(TunnelError::Exited),
            }
        }
        info!(url = %public_url, "Tunnel started");

        Ok(TunnelInfo {
            public_url,
            local_port: plan.port,
            direct_mapping: plan.direct,
            original_url: if plan.direct { target.url.clone() } else { None },
        })
    }

    /// Kill the running tunnel.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let running = self.slot.lock().await.take().ok_or(TunnelError::NotRunning)?;
        if let Some(kill) = running.kill {
            let _ = kill.send(());
        }
        info!("Tunnel stopped");
        Ok(())
    }

    pub async fn status(&self) -> TunnelStatus {
        let slot = self.slot.lock().await;
        TunnelStatus {
            running: slot.is_some(),
            public_url: slot.as_ref().and_then(|r| r.public_url.clone()),
        }
    }

    fn spawn(&self, port: u16) -> Result<Child, TunnelError> {
        let port = port.to_string();
        let args = expand_template(&self.config.args, &[("port", &port)]);
        Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    TunnelError::NotInstalled {
                        program: self.config.program.clone(),
                    }
                } else {
                    TunnelError::Spawn {
                        program: self.config.program.clone(),
                        source,
                    }
                }
            })
    }

    /// Poll the status API for the first `https` tunnel.
    async fn discover(&self, generation: u64) -> Result<String, TunnelError> {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(self.config.startup_grace_ms),
            delay: Duration::from_millis(self.config.poll_interval_ms),
            deadline: Some(Duration::from_millis(self.config.discovery_timeout_ms)),
        };
        let result = retry(&policy, |_| async move {
            if !self.is_current(generation).await {
                return Attempt::Abort(TunnelError::Exited);
            }
            match self.query_api().await {
                Some(url) => Attempt::Ready(url),
                None => Attempt::Pending,
            }
        })
        .await;
        match result {
            Ok(url) => Ok(url),
            Err(RetryError::Aborted(e)) => Err(e),
            Err(RetryError::Exhausted(_)) => Err(TunnelError::DiscoveryTimeout),
        }
    }

    async fn query_api(&self) -> Option<String> {
        let response = match self.http.get(&self.config.api_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Tunnel API not ready: {e}");
                return None;
            }
        };
        let body: ApiTunnels = response.json().await.ok()?;
        body.tunnels
            .into_iter()
            .find(|t| t.proto == "https" && !t.public_url.is_empty())
            .map(|t| t.public_url)
    }

    async fn is_current(&self, generation: u64) -> bool {
        matches!(self.slot.lock().await.as_ref(), Some(r) if r.generation == generation)
    }

    async fn kill_generation(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|r| r.generation == generation) {
            if let Some(kill) = slot.take().and_then(|r| r.kill) {
                let _ = kill.send(());
            }
        }
    }
}

/// Own the child until it exits or is told to die, then clear the slot if
/// it still belongs to this generation.
async fn watch_process(
    slot: Arc<Mutex<Option<Running>>>,
    generation: u64,
    mut child: Child,
    kill: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!("Tunnel process exited with {status}"),
            Err(e) => warn!("Tunnel process wait failed: {e}"),
        },
        _ = kill => {
            if let Err(e) = child.kill().await {
                debug!("Tunnel process already gone: {e}");
            }
        }
    }
    let mut slot = slot.lock().await;
    if slot.as_ref().is_some_and(|r| r.generation == generation) {
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn fake_api(body: Value) -> String {
        let app = Router::new().route(
            "/api/tunnels",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/api/tunnels")
    }

    fn ngrok_like() -> Value {
        json!({"tunnels": [
            {"proto": "http", "public_url": "http://abc.ngrok.app"},
            {"proto": "https", "public_url": "https://abc.ngrok.app"},
        ]})
    }

    fn manager(api_url: String, sleep_secs: &str) -> TunnelManager {
        let config = TunnelConfig {
            program: "sleep".to_string(),
            args: vec![sleep_secs.to_string()],
            api_url,
            startup_grace_ms: 10,
            poll_interval_ms: 10,
            discovery_timeout_ms: 2000,
            ..TunnelConfig::default()
        };
        TunnelManager::new(config, 8742, reqwest::Client::new())
    }

    fn target(kind: &str, url: Option<&str>) -> TunnelTarget {
        TunnelTarget {
            port: None,
            url: url.map(ToString::to_string),
            transport_type: Some(kind.to_string()),
        }
    }

    #[test]
    fn loopback_remote_targets_map_directly() {
        let p = plan(&target("sse", Some("http://localhost:9999/foo")), 8742).unwrap();
        assert_eq!(p, Plan { port: 9999, direct: true, path: Some("/foo".to_string()) });

        let p = plan(&target("streamable-http", Some("https://127.0.0.1/")), 8742).unwrap();
        assert_eq!(p, Plan { port: 443, direct: true, path: None });

        let p = plan(&target("sse", Some("https://example.com/sse")), 8742).unwrap();
        assert_eq!(p, Plan { port: 8742, direct: false, path: None });

        let p = plan(&target("stdio", Some("http://localhost:9999/foo")), 8742).unwrap();
        assert!(!p.direct);
    }

    #[tokio::test]
    async fn direct_mapping_appends_original_path() {
        let tunnels = manager(fake_api(ngrok_like()).await, "30");
        let info = tunnels
            .start(&target("sse", Some("http://localhost:9999/foo")))
            .await
            .unwrap();
        assert!(info.direct_mapping);
        assert_eq!(info.local_port, 9999);
        assert_eq!(info.public_url, "https://abc.ngrok.app/foo");
        assert_eq!(info.original_url.as_deref(), Some("http://localhost:9999/foo"));
        tunnels.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bridge_mode_appends_sse_suffix() {
        let tunnels = manager(fake_api(ngrok_like()).await, "30");
        let info = tunnels.start(&target("stdio", None)).await.unwrap();
        assert!(!info.direct_mapping);
        assert_eq!(info.local_port, 8742);
        assert_eq!(info.public_url, "https://abc.ngrok.app/sse");
        assert_eq!(
            tunnels.status().await,
            TunnelStatus {
                running: true,
                public_url: Some("https://abc.ngrok.app/sse".to_string()),
            }
        );
        tunnels.stop().await.unwrap();
        assert!(!tunnels.status().await.running);
    }

    #[tokio::test]
    async fn second_start_conflicts_and_keeps_first_url() {
        let tunnels = manager(fake_api(ngrok_like()).await, "30");
        let first = tunnels.start(&target("stdio", None)).await.unwrap();
        let err = tunnels.start(&target("stdio", None)).await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyRunning));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(tunnels.status().await.public_url, Some(first.public_url));
        tunnels.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_tunnel_is_client_error() {
        let tunnels = manager("http://127.0.0.1:9/api/tunnels".to_string(), "30");
        let err = tunnels.stop().await.unwrap_err();
        assert!(matches!(err, TunnelError::NotRunning));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn spontaneous_exit_clears_status() {
        let tunnels = manager(fake_api(ngrok_like()).await, "1");
        tunnels.start(&target("stdio", None)).await.unwrap();
        for _ in 0..60 {
            if !tunnels.status().await.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(
            tunnels.status().await,
            TunnelStatus {
                running: false,
                public_url: None,
            }
        );
    }

    #[tokio::test]
    async fn discovery_timeout_kills_process() {
        let api = fake_api(json!({"tunnels": []})).await;
        let mut tunnels = manager(api, "30");
        Arc::make_mut(&mut tunnels.config).discovery_timeout_ms = 200;
        let err = tunnels.start(&target("stdio", None)).await.unwrap_err();
        assert!(matches!(err, TunnelError::DiscoveryTimeout));
        assert!(!tunnels.status().await.running);
        // The slot is free again.
        assert!(matches!(tunnels.stop().await, Err(TunnelError::NotRunning)));
    }

    #[tokio::test]
    async fn missing_binary_reports_install_hint() {
        let mut tunnels = manager("http://127.0.0.1:9/api/tunnels".to_string(), "30");
        Arc::make_mut(&mut tunnels.config).program = "definitely-not-ngrok-xyz".to_string();
        let err = tunnels.start(&target("stdio", None)).await.unwrap_err();
        assert!(err.to_string().contains("Please install ngrok"));
        assert!(!tunnels.status().await.running);
    }
}
