//! Small helpers shared across modules.
//!
//! The bounded retry loop here drives both bridge readiness polling and tunnel
//! URL discovery.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Bounded retry schedule: wait `initial_delay`, attempt, then wait `delay`
/// between further attempts until `max_attempts` or `deadline` is reached.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub delay: Duration,
    /// Overall wall-clock budget, checked in addition to `max_attempts`.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// `max_attempts` tries, sleeping `delay` before each one.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            delay,
            deadline: None,
        }
    }
}

/// Outcome of a single attempt.
pub enum Attempt<T, E> {
    /// The success predicate held.
    Ready(T),
    /// Not yet; try again after the delay.
    Pending,
    /// Unrecoverable; stop retrying.
    Abort(E),
}

/// Why [`retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Attempt or time budget spent. Carries the number of attempts made.
    Exhausted(u32),
    Aborted(E),
}

/// Run `attempt` on the schedule described by `policy`.
///
/// `attempt` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let made = AtomicU32::new(0);
    let run = async {
        tokio::time::sleep(policy.initial_delay).await;
        loop {
            let n = made.fetch_add(1, Ordering::Relaxed) + 1;
            match attempt(n).await {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Abort(e) => return Err(RetryError::Aborted(e)),
                Attempt::Pending if n >= policy.max_attempts => {
                    return Err(RetryError::Exhausted(n));
                }
                Attempt::Pending => tokio::time::sleep(policy.delay).await,
            }
        }
    };
    match policy.deadline {
        Some(limit) => {
            let outcome = tokio::time::timeout(limit, run).await;
            outcome.unwrap_or_else(|_| Err(RetryError::Exhausted(made.load(Ordering::Relaxed))))
        }
        None => run.await,
    }
}

/// Substitute `{name}` placeholders in every template argument.
pub fn expand_template(args: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Whether `url` points at this machine (`localhost`, `127.0.0.1`, `0.0.0.0`).
pub fn is_loopback_url(url: &url::Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost" | "127.0.0.1" | "0.0.0.0")
    )
}
