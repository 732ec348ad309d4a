//! Bounded retry with a fixed delay and cooperative cancellation.
//!
//! The consumer retries delivery to the applier a fixed number of times. The
//! delay between attempts is raced against a [`CancellationToken`] so a
//! shutdown never waits out a pending backoff.
//!
//! # Example
//!
//! ```rust
//! use flight_ingest_runtime::retry::{RetryPolicy, retry_with_cancel};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .delay(Duration::from_millis(10))
//!     .build();
//! let cancel = CancellationToken::new();
//!
//! let result = retry_with_cancel(&policy, &cancel, |_attempt| async {
//!     Ok::<_, String>(42)
//! })
//! .await;
//! assert_eq!(result, Ok(42));
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Retry policy with a fixed delay between attempts.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `delay`: 5 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            delay: None,
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts. Values below 1 are raised to 1.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            delay: self.delay.unwrap_or(DEFAULT_DELAY),
        }
    }
}

/// Why a retried operation did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E: fmt::Display> {
    /// Every attempt failed
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },

    /// The token fired before an attempt succeeded
    #[error("retry cancelled")]
    Cancelled,
}

/// Run `operation` until it succeeds, the policy is exhausted or `cancel` fires.
///
/// `operation` receives the 1-based attempt number. Each failed attempt is
/// logged at warn level; wrap the call in a span to attach the caller's
/// identifiers.
///
/// Cancellation is checked before every attempt and raced against every
/// delay. An attempt that has already started is allowed to finish.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last error after
/// `policy.max_attempts` failures, or [`RetryError::Cancelled`] if `cancel`
/// fires first.
pub async fn retry_with_cancel<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "Operation failed after max attempts"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(attempt, "Retry cancelled during backoff");
                return Err(RetryError::Cancelled);
            }
            () = tokio::time::sleep(policy.delay) => {}
        }

        attempt += 1;
    }
}
