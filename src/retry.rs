//! Retry policy with fixed or exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value: the number of attempts, how long to
//! wait between them, and an optional per-attempt timeout. It is handed to the
//! command runner (see [`crate::runner::CommandRunnerExt::run`]) or to
//! [`retry_with_backoff`] for arbitrary async operations.
//!
//! # Example
//!
//! ```ignore
//! use keel::retry::{retry_with_backoff, RetryPolicy};
//!
//! let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(30));
//! let token = retry_with_backoff(&policy, "read_token", || async { read_token().await }).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// How long to wait between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay after every failed attempt
    Fixed(Duration),
    /// Delay grows by `multiplier` after each failure, capped at `max`
    Exponential {
        /// Delay after the first failure
        initial: Duration,
        /// Upper bound for any single delay
        max: Duration,
        /// Growth factor per failure
        multiplier: f64,
        /// Scale each delay by a random factor in 0.5..1.5
        jitter: bool,
    },
}

/// Bounded retry policy.
///
/// `max_attempts` is always at least 1; the constructors clamp.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    per_attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
            per_attempt_timeout: None,
        }
    }

    /// Doubling delay with jitter, capped at `max`
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial,
                max,
                multiplier: 2.0,
                jitter: true,
            },
            per_attempt_timeout: None,
        }
    }

    /// Kill and count as failed any attempt that runs longer than `timeout`
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    /// Maximum number of attempts (always >= 1)
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Per-attempt timeout, if any
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.per_attempt_timeout
    }

    /// Un-jittered delay after failed attempt number `attempt` (1-based)
    fn base_delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
                ..
            } => {
                let exp = attempt.saturating_sub(1).min(32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
        }
    }

    /// Delay to actually sleep after failed attempt `attempt`, jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match &self.backoff {
            Backoff::Exponential { jitter: true, .. } => {
                let factor = rand::thread_rng().gen_range(0.5..1.5);
                Duration::from_secs_f64(base.as_secs_f64() * factor)
            }
            _ => base,
        }
    }
}

/// Execute an async operation under a [`RetryPolicy`].
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. The last error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= policy.max_attempts() {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = policy.delay(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
