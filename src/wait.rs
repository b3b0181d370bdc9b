//! Bounded polling for provider state
//!
//! Every "wait until the provider reports X" step goes through
//! [`wait_until`]: poll with exponential backoff until the check is
//! satisfied, the deadline passes, or the token is cancelled.

use crate::error::{ForgeError, ForgeResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Poll interval, backoff cap and deadline of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// First sleep between checks
    pub interval: Duration,
    /// Upper bound for the doubled interval
    pub max_interval: Duration,
    /// Total time allowed
    pub timeout: Duration,
}

impl WaitPolicy {
    /// Policy with the given timeout and a 5s..30s backoff
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            timeout,
        }
    }

    /// Override the backoff bounds
    pub fn with_intervals(mut self, interval: Duration, max_interval: Duration) -> Self {
        self.interval = interval;
        self.max_interval = max_interval.max(interval);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

/// Poll `check` until it yields `Some(value)`.
///
/// `Ok(None)` keeps waiting, `Err` aborts the wait immediately. Running past
/// the deadline returns [`ForgeError::Timeout`]; cancellation returns
/// [`ForgeError::Cancelled`] without waiting out the current interval.
pub async fn wait_until<T, F, Fut>(
    operation: &str,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> ForgeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ForgeResult<Option<T>>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut interval = policy.interval;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled(operation.to_string()));
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled(operation.to_string())),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ForgeError::timeout(operation, started.elapsed()))
            }
            outcome = check() => outcome?,
        };

        if let Some(value) = outcome {
            debug!("{} satisfied after {} check(s)", operation, attempts);
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ForgeError::timeout(operation, started.elapsed()));
        }

        let sleep_for = interval.min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ForgeError::Cancelled(operation.to_string())),
            _ = tokio::time::sleep(sleep_for) => {}
        }
        interval = policy.next_interval(interval);
    }
}
