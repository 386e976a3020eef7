//! Builds the server-facing half of a session from a connect request.
//!
//! | `transportType`   | Required params        | Result                                   |
//! |-------------------|------------------------|------------------------------------------|
//! | `stdio`           | `command` (+ `args`, `env`) | bridge process + SSE client to it   |
//! | `sse`             | `url`                  | SSE client to the remote endpoint        |
//! | `streamable-http` | `url`                  | streamable-HTTP client                   |
//!
//! For remote kinds a small set of inbound request headers is forwarded so
//! the caller's credentials reach the upstream server.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use reqwest::header::HeaderName;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

use crate::bridge::{self, BridgeProcess, BridgeSlot};
use crate::config::BridgeConfig;
use crate::transport::{
    sse, streamable::StreamableHttpClient, TransportError, TransportKind, TransportLink,
};

/// Headers forwarded to legacy SSE servers.
const SSE_PASSTHROUGH: &[&str] = &["authorization"];

/// Headers forwarded to streamable-HTTP servers.
const STREAMABLE_PASSTHROUGH: &[&str] = &["authorization", "mcp-session-id", "last-event-id"];

/// Names another inbound header whose value should also be forwarded.
const CUSTOM_AUTH_HEADER: &str = "x-custom-auth-header";

/// Query parameters of a connect request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub transport_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
    /// JSON object of extra environment variables for stdio servers.
    #[serde(default)]
    pub env: Option<String>,
}

/// Server-facing transport plus whatever it needs kept alive.
pub enum ServerTransport {
    Stdio {
        link: TransportLink,
        bridge: BridgeProcess,
        /// Bridge stderr, chunk by chunk.
        diagnostics: mpsc::Receiver<String>,
    },
    Sse {
        link: TransportLink,
    },
    StreamableHttp {
        link: TransportLink,
        client: Arc<StreamableHttpClient>,
    },
}

impl ServerTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

/// Creates server transports. Shared by every connect route.
pub struct TransportFactory {
    http: reqwest::Client,
    bridge: BridgeConfig,
    /// At most one stdio session owns the bridge port.
    bridge_slot: BridgeSlot,
}

impl TransportFactory {
    pub fn new(http: reqwest::Client, bridge: BridgeConfig) -> Self {
        Self {
            http,
            bridge,
            bridge_slot: BridgeSlot::new(),
        }
    }

    /// Build the transport described by `params`, forwarding the relevant
    /// entries of `inbound` to remote servers.
    pub async fn create(
        &self,
        params: &ConnectParams,
        inbound: &HeaderMap,
    ) -> Result<ServerTransport, TransportError> {
        let raw_kind = params
            .transport_type
            .as_deref()
            .ok_or(TransportError::MissingParameter("transportType"))?;
        let kind = TransportKind::parse(raw_kind)?;
        info!(transport = kind.as_str(), "Creating server transport");

        match kind {
            TransportKind::Stdio => self.create_stdio(params).await,
            TransportKind::Sse => {
                let url = required_url(params)?;
                let headers = forwarded_headers(inbound, SSE_PASSTHROUGH);
                info!(url = %url, "Connecting to SSE server");
                let link = sse::connect(&self.http, url, headers).await?;
                Ok(ServerTransport::Sse { link })
            }
            TransportKind::StreamableHttp => {
                let url = required_url(params)?;
                let headers = forwarded_headers(inbound, STREAMABLE_PASSTHROUGH);
                info!(url = %url, "Connecting to streamable HTTP server");
                let (link, client) = StreamableHttpClient::start(self.http.clone(), url, headers);
                Ok(ServerTransport::StreamableHttp { link, client })
            }
        }
    }

    async fn create_stdio(
        &self,
        params: &ConnectParams,
    ) -> Result<ServerTransport, TransportError> {
        let command = params
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(TransportError::MissingParameter("command"))?;
        let command_line =
            bridge::user_command_line(command, params.args.as_deref().unwrap_or_default())?;
        let request_env = parse_env(params.env.as_deref())?;
        let env = bridge::bridge_env(
            bridge::inherited_env(),
            &self.bridge.default_env,
            &request_env,
        );

        let lease = self.bridge_slot.acquire(self.bridge.port)?;
        let (mut process, diagnostics) =
            bridge::launch(&self.bridge, &self.http, lease, &command_line, env).await?;

        let url = bridge::bridge_url(&self.bridge)?;
        info!(url = %url, "Connecting to bridge");
        match sse::connect(&self.http, url, reqwest::header::HeaderMap::new()).await {
            Ok(link) => Ok(ServerTransport::Stdio {
                link,
                bridge: process,
                diagnostics,
            }),
            Err(e) => {
                process.kill().await;
                Err(e)
            }
        }
    }
}

fn required_url(params: &ConnectParams) -> Result<Url, TransportError> {
    let raw = params
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or(TransportError::MissingParameter("url"))?;
    Url::parse(raw).map_err(|e| TransportError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_env(raw: Option<&str>) -> Result<HashMap<String, String>, TransportError> {
    match raw.filter(|r| !r.trim().is_empty()) {
        Some(raw) => {
            serde_json::from_str(raw).map_err(|e| TransportError::InvalidEnv(e.to_string()))
        }
        None => Ok(HashMap::new()),
    }
}

/// Copy the pass-through headers, plus the header named by
/// `x-custom-auth-header` when present.
pub fn forwarded_headers(
    inbound: &HeaderMap,
    passthrough: &[&'static str],
) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for name in passthrough {
        // Last value wins for repeated headers.
        if let Some(value) = inbound.get_all(*name).iter().last() {
            out.insert(HeaderName::from_static(*name), value.clone());
        }
    }
    let custom = inbound
        .get(CUSTOM_AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|n| HeaderName::from_bytes(n.trim().as_bytes()).ok());
    if let Some(name) = custom {
        if let Some(value) = inbound.get(&name) {
            out.insert(name, value.clone());
        }
    }
    out
}
