//! Retry with exponential backoff and error classification.
//!
//! Every outbound HTTP call in the worker runs through [`retry_with_backoff`].
//! The attempt closure classifies its own failures:
//!
//! - [`RetryError::Transient`] — worth another attempt (rate limits,
//!   timeouts, helper-declared transient errors). Sleeps and retries up to
//!   the attempt budget.
//! - [`RetryError::Permanent`] — short-circuits immediately (unexpected
//!   status codes, malformed responses).
//!
//! Delays grow as `500 ms × 1.5ⁿ`, capped at 60 s, with a deterministic
//! jitter factor in `[0.5, 1.0]` derived from the attempt number.
//! Cancellation is honored at every sleep: a fired token returns the pending
//! transient error (or a cancellation error before the first attempt)
//! without further waiting.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

/// Initial backoff delay.
const INITIAL_DELAY_MS: u64 = 500;
/// Growth factor between attempts.
const MULTIPLIER: f64 = 1.5;
/// Upper bound on a single delay.
const MAX_DELAY_MS: u64 = 60_000;

/// A classified attempt failure.
#[derive(Debug)]
pub enum RetryError {
    /// The operation may succeed on a later attempt.
    Transient(anyhow::Error),
    /// Retrying cannot help; surface the error as-is.
    Permanent(anyhow::Error),
}

impl RetryError {
    /// Wrap an error as transient.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    /// Wrap an error as permanent.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Transient(e) | Self::Permanent(e) => e,
        }
    }
}

/// Backoff delay for a zero-indexed attempt number.
///
/// Jitter is deterministic (attempt-derived) so behavior is reproducible
/// under test; the factor stays within `[0.5, 1.0]` of the nominal delay.
fn delay_for_attempt(attempt: u32) -> Duration {
    let nominal = INITIAL_DELAY_MS as f64 * MULTIPLIER.powi(attempt as i32);
    let nominal = nominal.min(MAX_DELAY_MS as f64);
    let jitter = (attempt as f64 * 0.37).fract() * 0.5 + 0.5;
    Duration::from_millis((nominal * jitter) as u64)
}

/// Run `op` until it succeeds, fails permanently, exhausts `max_attempts`,
/// or `cancel` fires.
///
/// # Errors
///
/// - The permanent error, when an attempt classifies its failure as such.
/// - The last transient error, when the budget is exhausted or cancellation
///   interrupts a pending retry.
/// - A cancellation error, when the token is already fired before the first
///   attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    max_attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    assert!(max_attempts > 0, "max_attempts must be at least 1");

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(anyhow!("operation cancelled before attempt {}", attempt + 1));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(err)) => return Err(err),
            Err(RetryError::Transient(err)) => {
                if attempt + 1 == max_attempts {
                    return Err(err);
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay_for_attempt(attempt)) => {}
                    _ = cancel.cancelled() => return Err(err),
                }
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}
