//! Bounded polling of a predicate with a monotonic deadline.
//!
//! Every convergence check in the harness goes through [`poll_until`] or
//! [`wait`]. The predicate runs serially on the caller's task; there is no
//! background polling.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ErrorKind;

pub const STANDARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub const STANDARD: WaitPolicy = WaitPolicy {
        timeout: STANDARD_TIMEOUT,
        interval: RETRY_INTERVAL,
    };

    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Same interval, timeout multiplied by `factor`.
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            timeout: self.timeout * factor,
            interval: self.interval,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout,
            interval: self.interval,
        }
    }

    /// Upper bound on predicate evaluations: `ceil(timeout / interval) + 1`.
    pub fn max_attempts(&self) -> u64 {
        if self.interval.is_zero() {
            return u64::MAX;
        }
        let timeout = self.timeout.as_nanos();
        let interval = self.interval.as_nanos();
        let steps = timeout.div_ceil(interval);
        u64::try_from(steps).unwrap_or(u64::MAX).saturating_add(1)
    }
}

/// Classifies predicate errors for [`poll_until`].
pub trait Retry: Display {
    /// `Some(kind)` ends the wait at once instead of polling again.
    fn permanent(&self) -> Option<ErrorKind> {
        None
    }
}

impl Retry for String {}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::STANDARD
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for {what} after {attempts} attempt(s){}", describe(.last_error))]
    Timeout {
        what: String,
        attempts: u64,
        last_error: Option<String>,
    },

    #[error("gave up waiting for {what} after {attempts} attempt(s): {error}")]
    Aborted {
        what: String,
        attempts: u64,
        kind: ErrorKind,
        error: String,
    },

    #[error("cancelled while waiting for {what}{}", describe(.last_error))]
    Cancelled {
        what: String,
        last_error: Option<String>,
    },
}

impl WaitError {
    pub fn last_error(&self) -> Option<&str> {
        match self {
            WaitError::Timeout { last_error, .. } | WaitError::Cancelled { last_error, .. } => {
                last_error.as_deref()
            }
            WaitError::Aborted { error, .. } => Some(error),
        }
    }
}

fn describe(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(": last error: {}", e),
        None => String::new(),
    }
}

/// Extracts the message carried by a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Polls `predicate` until it yields `Some(value)`.
///
/// The predicate is evaluated once immediately and then at most once per
/// `policy.interval` until the deadline passes. Retryable errors returned
/// by the predicate do not stop the loop; the most recent one is carried by
/// the returned [`WaitError`]. A panicking predicate is recorded the same
/// way. An error whose [`Retry::permanent`] is set ends the wait with
/// [`WaitError::Aborted`].
/// Cancellation of `ctx` interrupts the sleep between attempts and is also
/// checked before each attempt.
pub async fn poll_until<T, E, F, Fut>(
    ctx: &CancellationToken,
    policy: WaitPolicy,
    what: &str,
    mut predicate: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: Retry,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts: u64 = 0;
    let mut last_error: Option<String> = None;

    loop {
        if ctx.is_cancelled() {
            return Err(WaitError::Cancelled {
                what: what.to_string(),
                last_error,
            });
        }

        attempts += 1;
        let outcome = AssertUnwindSafe(async { predicate().await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(Some(value))) => {
                debug!(what, attempts, "condition met");
                return Ok(value);
            }
            Ok(Ok(None)) => {
                debug!(what, attempts, "condition not met yet");
            }
            Ok(Err(e)) => {
                if let Some(kind) = e.permanent() {
                    debug!(what, attempts, error = %e, ?kind, "condition check failed for good");
                    return Err(WaitError::Aborted {
                        what: what.to_string(),
                        attempts,
                        kind,
                        error: e.to_string(),
                    });
                }
                debug!(what, attempts, error = %e, "condition check failed");
                last_error = Some(e.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                debug!(what, attempts, panic = %message, "condition check panicked");
                last_error = Some(format!("predicate panicked: {}", message));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                what: what.to_string(),
                attempts,
                last_error,
            });
        }

        let pause = policy.interval.min(deadline - now);
        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(WaitError::Cancelled {
                    what: what.to_string(),
                    last_error,
                });
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Boolean form of [`poll_until`].
pub async fn wait<E, F, Fut>(
    ctx: &CancellationToken,
    policy: WaitPolicy,
    what: &str,
    mut predicate: F,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Retry,
{
    poll_until(ctx, policy, what, || {
        let check = predicate();
        async move { check.await.map(|ok| ok.then_some(())) }
    })
    .await
}
