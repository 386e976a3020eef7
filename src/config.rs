//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags**: `--env` / `--args` (default command prefill)
//! 2. **Environment variables**: `HOST`, `PORT`, `CLIENT_PORT`,
//!    `ALLOWED_ORIGINS`, `DANGEROUSLY_OMIT_AUTH`, `SUPERGATEWAY_PORT`,
//!    `MCP_ENV_VARS`
//! 3. **Config file**: path via `--config <path>`, or `mcp-relay.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 6277
//!
//! [security]
//! client_port = 6274
//! allowed_origins = ["http://localhost:6274"]   # omit for the defaults
//! auth_disabled = false
//!
//! [bridge]
//! port = 8742
//! program = "npx"
//! args = ["-y", "supergateway", "--stdio", "{command}", "--port", "{port}"]
//! ready_attempts = 30
//! ready_interval_ms = 1000
//!
//! [tunnel]
//! program = "ngrok"
//! args = ["http", "{port}"]
//! api_url = "http://127.0.0.1:4040/api/tunnels"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "mcp-relay.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind (default `127.0.0.1`). Override with `HOST`.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind (default 6277). Override with `PORT`.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Origin allow-list and token authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Port the browser client is served from (default 6274). Used to build the
    /// default origin allow-list. Override with `CLIENT_PORT`.
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// Explicit origin allow-list. Override with comma-separated
    /// `ALLOWED_ORIGINS`.
    #[serde(default)]
    pub allowed_origins: Option<Vec<String>>,
    /// Skip token authentication entirely. Set `DANGEROUSLY_OMIT_AUTH=true`.
    #[serde(default)]
    pub auth_disabled: bool,
}

/// Settings for the stdio bridging process.
///
/// `args` is a template: `{command}` is replaced by the user's full command
/// line and `{port}` by [`BridgeConfig::port`].
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Local port the bridge listens on (default 8742). Override with
    /// `SUPERGATEWAY_PORT`.
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    /// Host used to reach the bridge (default `localhost`).
    #[serde(default = "default_bridge_host")]
    pub host: String,
    /// Launcher binary (default `npx`).
    #[serde(default = "default_bridge_program")]
    pub program: String,
    /// Launcher argument template.
    #[serde(default = "default_bridge_args")]
    pub args: Vec<String>,
    /// Path of the bridge's SSE endpoint (default `/sse`).
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    /// Readiness probes before giving up (default 30).
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    /// Delay before each readiness probe in milliseconds (default 1000).
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,
    /// Per-probe request timeout in milliseconds (default 500).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Extra environment merged over the inherited defaults. Extended by the
    /// JSON object in `MCP_ENV_VARS`.
    #[serde(default)]
    pub default_env: HashMap<String, String>,
}

/// Settings for the public tunnel process.
///
/// `args` is a template: `{port}` is replaced by the local target port.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel binary (default `ngrok`).
    #[serde(default = "default_tunnel_program")]
    pub program: String,
    /// Tunnel argument template (default `["http", "{port}"]`).
    #[serde(default = "default_tunnel_args")]
    pub args: Vec<String>,
    /// Local status API listing active tunnels.
    #[serde(default = "default_tunnel_api_url")]
    pub api_url: String,
    /// Delay before the first status poll in milliseconds (default 2000).
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Delay between status polls in milliseconds (default 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall URL discovery budget in milliseconds (default 10 000).
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Path appended to the public URL when tunnelling the bridge (default `/sse`).
    #[serde(default = "default_sse_path")]
    pub bridge_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Values handed to the UI through `GET /config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    /// Default server command (from `--env`).
    #[serde(default)]
    pub command: String,
    /// Default server arguments (from `--args`).
    #[serde(default)]
    pub args: String,
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6277
}
fn default_client_port() -> u16 {
    6274
}
fn default_bridge_port() -> u16 {
    8742
}
fn default_bridge_host() -> String {
    "localhost".to_string()
}
fn default_bridge_program() -> String {
    "npx".to_string()
}
fn default_bridge_args() -> Vec<String> {
    [
        "-y",
        "supergateway",
        "--stdio",
        "{command}",
        "--port",
        "{port}",
        "--baseUrl",
        "http://localhost:{port}",
        "--ssePath",
        "/sse",
        "--messagePath",
        "/message",
        "--logLevel",
        "none",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}
fn default_sse_path() -> String {
    "/sse".to_string()
}
fn default_ready_attempts() -> u32 {
    30
}
fn default_ready_interval_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    500
}
fn default_tunnel_program() -> String {
    "ngrok".to_string()
}
fn default_tunnel_args() -> Vec<String> {
    vec!["http".to_string(), "{port}".to_string()]
}
fn default_tunnel_api_url() -> String {
    "http://127.0.0.1:4040/api/tunnels".to_string()
}
fn default_startup_grace_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            client_port: default_client_port(),
            allowed_origins: None,
            auth_disabled: false,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_bridge_port(),
            host: default_bridge_host(),
            program: default_bridge_program(),
            args: default_bridge_args(),
            sse_path: default_sse_path(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            default_env: HashMap::new(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            program: default_tunnel_program(),
            args: default_tunnel_args(),
            api_url: default_tunnel_api_url(),
            startup_grace_ms: default_startup_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            bridge_path: default_sse_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl SecurityConfig {
    /// Origins allowed to call the proxy from a browser.
    ///
    /// The explicit list wins; otherwise `http://localhost:<client_port>` and
    /// `http://127.0.0.1:<client_port>`.
    pub fn effective_origins(&self) -> Vec<String> {
        match &self.allowed_origins {
            Some(origins) => origins.clone(),
            None => vec![
                format!("http://localhost:{}", self.client_port),
                format!("http://127.0.0.1:{}", self.client_port),
            ],
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `mcp-relay.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_port("PORT", &port)?;
        }
        if let Some(port) = lookup("CLIENT_PORT") {
            self.security.client_port = parse_port("CLIENT_PORT", &port)?;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.security.allowed_origins = Some(
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            );
        }
        if let Some(flag) = lookup("DANGEROUSLY_OMIT_AUTH") {
            self.security.auth_disabled = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(port) = lookup("SUPERGATEWAY_PORT") {
            self.bridge.port = parse_port("SUPERGATEWAY_PORT", &port)?;
        }
        if let Some(raw) = lookup("MCP_ENV_VARS") {
            let extra: HashMap<String, String> =
                serde_json::from_str(&raw).map_err(|e| ConfigError::Env {
                    var: "MCP_ENV_VARS",
                    reason: e.to_string(),
                })?;
            self.bridge.default_env.extend(extra);
        }
        Ok(())
    }
}

fn parse_port(var: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        reason: format!("`{value}` is not a port number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_published_ports() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr(), "127.0.0.1:6277");
        assert_eq!(config.bridge.port, 8742);
        assert_eq!(config.bridge.ready_attempts, 30);
        assert_eq!(config.tunnel.discovery_timeout_ms, 10_000);
        assert!(!config.security.auth_disabled);
    }

    #[test]
    fn default_origins_follow_client_port() {
        let mut config = Config::default();
        config.apply_env(env(&[("CLIENT_PORT", "5173")])).unwrap();
        assert_eq!(
            config.security.effective_origins(),
            vec!["http://localhost:5173", "http://127.0.0.1:5173"]
        );
    }

    #[test]
    fn allowed_origins_env_replaces_defaults() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("ALLOWED_ORIGINS", "https://a.example, https://b.example")]))
            .unwrap();
        assert_eq!(
            config.security.effective_origins(),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn env_overrides_ports_and_auth() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("PORT", "7000"),
                ("SUPERGATEWAY_PORT", "9000"),
                ("DANGEROUSLY_OMIT_AUTH", "true"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.bridge.port, 9000);
        assert!(config.security.auth_disabled);
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn mcp_env_vars_merge_into_bridge_env() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("MCP_ENV_VARS", r#"{"API_KEY":"abc"}"#)]))
            .unwrap();
        assert_eq!(config.bridge.default_env.get("API_KEY").unwrap(), "abc");
    }

    #[test]
    fn toml_sections_fill_missing_fields_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            port = 9100

            [tunnel]
            program = "cloudflared"
            "#,
        )
        .unwrap();
        assert_eq!(config.bridge.port, 9100);
        assert_eq!(config.bridge.program, "npx");
        assert_eq!(config.tunnel.program, "cloudflared");
        assert_eq!(config.tunnel.args, vec!["http", "{port}"]);
    }
}
