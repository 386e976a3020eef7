#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # mcp-relay
//!
//! Local inspector proxy for MCP agent servers.
//!
//! A browser client connects to mcp-relay, which opens the matching
//! server-facing transport (a stdio program behind a bridging process, a
//! remote SSE server, or a remote streamable-HTTP server) and relays messages
//! verbatim between the two for the lifetime of the session. An optional
//! public tunnel exposes the bridge or a local remote-HTTP server.
//!
//! ## Subcommands
//!
//! - `mcp-relay serve` (default): run the proxy
//! - `mcp-relay deps check`: report which helper tools are installed
//! - `mcp-relay deps install`: install missing helper tools
//! - `mcp-relay deps ngrok-auth <token>`: store the tunnel auth token
//!
//! ## API surface
//!
//! | Method          | Path             | Auth | Description                        |
//! |-----------------|------------------|------|------------------------------------|
//! | GET             | `/health`        | No   | Liveness probe                     |
//! | GET             | `/config`        | Yes  | Prefill values for the connect form|
//! | GET             | `/stdio`, `/sse` | Yes  | Open a streaming session           |
//! | POST            | `/message`       | Yes  | Deliver a message to a session     |
//! | GET/POST/DELETE | `/mcp`           | Yes  | Streamable-HTTP sessions           |
//! | POST            | `/tunnel/start`  | Yes  | Start the public tunnel            |
//! | POST            | `/tunnel/stop`   | Yes  | Stop the public tunnel             |
//! | GET             | `/tunnel/status` | Yes  | Tunnel state                       |
//!
//! "Auth" means the origin allow-list plus the proxy token, passed as
//! `?MCP_PROXY_AUTH_TOKEN=<token>` or `X-MCP-Proxy-Auth: Bearer <token>`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs            entry point, clap subcommands, banner, graceful shutdown
//! auth.rs            origin and token middleware, constant-time comparison
//! config.rs          TOML + env-var configuration
//! state.rs           AppState shared by every handler
//! transport/
//!   mod.rs           TransportLink, TransportEvent, TransportKind, errors
//!   sse.rs           SSE client (server-facing) and server (client-facing)
//!   streamable.rs    streamable-HTTP client and server
//! bridge.rs          stdio bridging process: spawn, readiness, stderr
//! factory.rs         connect parameters → ServerTransport
//! sessions.rs        session registry
//! relay.rs           per-session message pump
//! tunnel.rs          singleton ngrok tunnel
//! deps.rs            helper tool status and installation
//! routes/            HTTP handlers and router assembly
//! ```

use std::io::ErrorKind;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use mcp_relay::auth::TOKEN_QUERY_PARAM;
use mcp_relay::config::Config;
use mcp_relay::deps::{DependencyManager, InstallProgress};
use mcp_relay::{routes, AppState, SessionToken};

/// Local inspector proxy for MCP agent servers.
#[derive(Parser)]
#[command(name = "mcp-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy (default when no subcommand given).
    Serve(ServeArgs),
    /// Check or install the helper tools.
    Deps {
        #[command(subcommand)]
        action: DepsAction,
    },
}

#[derive(clap::Args, Default)]
struct ServeArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Default server command offered to the client.
    #[arg(long)]
    env: Option<String>,
    /// Default server arguments offered to the client.
    #[arg(long)]
    args: Option<String>,
}

#[derive(Subcommand)]
enum DepsAction {
    /// Report which helper tools are installed.
    Check,
    /// Install missing helper tools (requires Homebrew).
    Install,
    /// Store the ngrok auth token.
    NgrokAuth {
        /// Token from the ngrok dashboard.
        token: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve(args)) => run_server(args).await,
        Some(Commands::Deps { action }) => run_deps(action).await,
        None => run_server(ServeArgs::default()).await,
    }
}

fn init_tracing(level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(args: ServeArgs) {
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mcp-relay: {e}");
            std::process::exit(1);
        }
    };
    if let Some(command) = args.env {
        config.defaults.command = command;
    }
    if let Some(server_args) = args.args {
        config.defaults.args = server_args;
    }

    init_tracing(&config.logging.level);
    info!("mcp-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let token = SessionToken::generate();
    let state = AppState::new(config, token);
    let app = routes::router(state.clone());

    let listen = state.config.server.listen_addr();
    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            error!("Proxy Server PORT IS IN USE at {listen}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Failed to bind {listen}: {e}");
            std::process::exit(1);
        }
    };

    print_banner(&state);

    let shutdown = {
        let state = state.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down...");
            state.shutdown().await;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

fn print_banner(state: &AppState) {
    let config = &state.config;
    info!("Proxy server listening on {}", config.server.listen_addr());
    if config.security.auth_disabled {
        warn!("Authentication is disabled (DANGEROUSLY_OMIT_AUTH). This is not recommended.");
        return;
    }
    let token = state.token.expose();
    info!("Session token: {token}");
    info!(
        "Use this token to authenticate requests or set DANGEROUSLY_OMIT_AUTH=true to disable auth"
    );
    info!(
        "Open the client with the token pre-filled: http://localhost:{}/?{TOKEN_QUERY_PARAM}={token}",
        config.security.client_port
    );
}

async fn run_deps(action: DepsAction) {
    init_tracing("info");
    let manager = DependencyManager::default();

    let result = match action {
        DepsAction::Check => {
            let status = manager.check().await;
            let mark = |present: bool| if present { "installed" } else { "missing" };
            println!("ngrok:        {}", mark(status.ngrok));
            println!("supergateway: {}", mark(status.supergateway));
            println!("brew:         {}", mark(status.brew));
            if !status.all_present() {
                std::process::exit(1);
            }
            Ok(())
        }
        DepsAction::Install => {
            let (tx, mut rx) = mpsc::channel::<InstallProgress>(8);
            let printer = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    println!("[{}/{}] {}", progress.current, progress.total, progress.message);
                }
            });
            let result = manager.install_missing(&tx).await;
            drop(tx);
            let _ = printer.await;
            result
        }
        DepsAction::NgrokAuth { token } => manager.configure_ngrok(&token).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
