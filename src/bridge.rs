//! Supervised stdio→SSE bridge process.
//!
//! A stdio server can't be reached over HTTP directly, so the relay launches a
//! bridge (supergateway by default) that runs the user's command and exposes
//! it as a legacy SSE endpoint on a fixed local port:
//!
//! ```text
//!   npx -y supergateway --stdio "<command> <args…>" --port 8742 …
//!          │
//!          ▼
//!   http://localhost:8742/sse   ◀── readiness probe, then SSE client
//! ```
//!
//! The child's stderr is read continuously and forwarded, chunk by chunk, on
//! the diagnostics channel. The child is killed when [`BridgeProcess`] is
//! dropped or [`BridgeProcess::kill`] is called.
//!
//! The port is shared, so only one bridge may run at a time. [`BridgeSlot`]
//! hands out that right; a process keeps its lease until it is killed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, ACCEPT};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BridgeConfig;
use crate::transport::TransportError;
use crate::util::{expand_template, retry, Attempt, RetryError, RetryPolicy};

/// Variables forced on the bridge so the launcher stays quiet on stderr.
const QUIET_ENV: &[(&str, &str)] = &[
    ("NPM_CONFIG_LOGLEVEL", "silent"),
    ("NPM_CONFIG_UPDATE_NOTIFIER", "false"),
];

/// Variables inherited from the proxy's own environment.
const INHERITED_ENV: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Stderr chunks buffered before the reader waits on the relay.
const DIAGNOSTICS_CAPACITY: usize = 64;

/// Exclusive right to run the bridge on its port.
#[derive(Clone, Default)]
pub struct BridgeSlot(Arc<Mutex<()>>);

/// Held by the one live bridge.
pub struct BridgeLease {
    _guard: OwnedMutexGuard<()>,
}

impl BridgeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or fail with [`TransportError::BridgeBusy`] while
    /// another bridge holds it.
    pub fn acquire(&self, port: u16) -> Result<BridgeLease, TransportError> {
        Arc::clone(&self.0)
            .try_lock_owned()
            .map(|guard| BridgeLease { _guard: guard })
            .map_err(|_| TransportError::BridgeBusy { port })
    }
}

/// A running bridge child.
pub struct BridgeProcess {
    child: Child,
    port: u16,
    lease: Option<BridgeLease>,
}

impl BridgeProcess {
    #[cfg(test)]
    pub(crate) fn adopt(child: Child, port: u16) -> Self {
        Self {
            child,
            port,
            lease: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the child, reap it and give up the port.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Bridge already gone: {e}");
        }
        drop(self.lease.take());
    }
}

/// Join the user's command and shell-style argument string into the single
/// command line the bridge runs.
pub fn user_command_line(command: &str, args: &str) -> Result<String, TransportError> {
    let parsed = shlex::split(args)
        .ok_or_else(|| TransportError::InvalidArgs(format!("unbalanced quoting in `{args}`")))?;
    let joined = shlex::try_join(parsed.iter().map(String::as_str))
        .map_err(|e| TransportError::InvalidArgs(e.to_string()))?;
    Ok(format!("{command} {joined}").trim().to_string())
}

/// The safe subset of the proxy's environment passed on to the bridge.
/// Values that look like exported shell functions are skipped.
pub fn inherited_env() -> Vec<(String, String)> {
    INHERITED_ENV
        .iter()
        .filter_map(|key| {
            let value = std::env::var(key).ok()?;
            (!value.starts_with("()")).then(|| ((*key).to_string(), value))
        })
        .collect()
}

/// Environment for the bridge child, lowest precedence first: inherited
/// variables, configured defaults, request-supplied variables, then the
/// forced quiet flags.
pub fn bridge_env(
    inherited: impl IntoIterator<Item = (String, String)>,
    defaults: &HashMap<String, String>,
    request: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = inherited.into_iter().collect();
    env.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(request.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (k, v) in QUIET_ENV {
        env.insert((*k).to_string(), (*v).to_string());
    }
    env
}

/// URL of the bridge's SSE endpoint.
pub fn bridge_url(config: &BridgeConfig) -> Result<Url, TransportError> {
    let raw = format!("http://{}:{}{}", config.host, config.port, config.sse_path);
    Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
        url: raw,
        reason: e.to_string(),
    })
}

/// Launch the bridge for `command_line` and wait until it accepts HTTP.
///
/// Returns the process and the receiving end of its stderr diagnostics. On
/// failure the child has already been killed and `lease` released.
pub async fn launch(
    config: &BridgeConfig,
    http: &reqwest::Client,
    lease: BridgeLease,
    command_line: &str,
    env: HashMap<String, String>,
) -> Result<(BridgeProcess, mpsc::Receiver<String>), TransportError> {
    let port = config.port.to_string();
    let args = expand_template(&config.args, &[("command", command_line), ("port", &port)]);

    info!(command = %command_line, port = config.port, "Starting stdio bridge");
    let mut child = Command::new(&config.program)
        .args(&args)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::Spawn {
            program: config.program.clone(),
            source,
        })?;

    let (diag_tx, diag_rx) = mpsc::channel(DIAGNOSTICS_CAPACITY);
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr, diag_tx));
    }

    let mut process = BridgeProcess {
        child,
        port: config.port,
        lease: Some(lease),
    };
    if let Err(e) = wait_ready(config, http, &mut process).await {
        process.kill().await;
        return Err(e);
    }
    Ok((process, diag_rx))
}

/// Poll the bridge's SSE endpoint until anything answers.
async fn wait_ready(
    config: &BridgeConfig,
    http: &reqwest::Client,
    process: &mut BridgeProcess,
) -> Result<(), TransportError> {
    let url = bridge_url(config)?;
    let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
    let policy = RetryPolicy::fixed(
        config.ready_attempts,
        Duration::from_millis(config.ready_interval_ms),
    );

    let result = retry(&policy, |attempt| {
        let exited = match process.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        };
        let request = http
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .timeout(probe_timeout);
        let attempts = config.ready_attempts;
        async move {
            if let Some(status) = exited {
                return Attempt::Abort(TransportError::BridgeExited { status });
            }
            // Any HTTP response, even an error, means the port is listening.
            match request.send().await {
                Ok(_) => {
                    info!(attempt, "Bridge is ready");
                    Attempt::Ready(())
                }
                Err(_) => {
                    if attempt % 5 == 0 {
                        info!("Still waiting for bridge... ({attempt}/{attempts})");
                    }
                    Attempt::Pending
                }
            }
        }
    })
    .await;

    match result {
        // Whatever answered, it wasn't this child if the child is gone.
        Ok(()) => match process.child.try_wait() {
            Ok(Some(status)) => Err(TransportError::BridgeExited {
                status: status.to_string(),
            }),
            _ => Ok(()),
        },
        Err(RetryError::Aborted(e)) => Err(e),
        Err(RetryError::Exhausted(attempts)) => Err(TransportError::BridgeTimeout {
            port: config.port,
            attempts,
        }),
    }
}

async fn forward_stderr(mut stderr: tokio::process::ChildStderr, tx: mpsc::Sender<String>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Bridge stderr read failed: {e}");
                return;
            }
        }
    }
}
