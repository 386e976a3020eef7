#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! mcp-relay library: the proxy/session core behind the `mcp-relay` binary.
//!
//! Building blocks:
//! - `auth`: origin allow-listing and proxy token middleware
//! - `config`: configuration loading
//! - `transport`: the transport link abstraction plus SSE and streamable-HTTP
//!   client/server transports
//! - `bridge`: supervised stdio-to-SSE bridging process
//! - `factory`: builds the server-facing transport for a connect request
//! - `sessions`: session registry
//! - `relay`: message pump between the two transports of a session
//! - `tunnel`: singleton public tunnel process
//! - `deps`: helper tool status and installation
//! - `routes`: HTTP route handlers and router assembly

pub mod auth;
pub mod bridge;
pub mod config;
pub mod deps;
pub mod factory;
pub mod relay;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod transport;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use auth::{SecurityGate, SessionToken};
pub use config::Config;
pub use factory::{ServerTransport, TransportFactory};
pub use sessions::SessionRegistry;
pub use state::AppState;
pub use tunnel::TunnelManager;
