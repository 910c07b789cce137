//! Bounded-attempt retry with classified backoff.
//!
//! The driver is stateless across invocations: classification only changes
//! the delay before the next attempt of the current invocation.

use std::future::Future;

use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::engine::error::ExecutionError;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_secs(30);
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(120);

/// A failure whose message carries a rate-limit marker gets the extended
/// delay before the next attempt.
pub fn is_rate_limit_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["429", "quota", "rate limit"]
        .iter()
        .any(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: BASE_DELAY,
            rate_limit_delay: RATE_LIMIT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, message: &str) -> Duration {
        if is_rate_limit_failure(message) {
            self.rate_limit_delay
        } else {
            self.base_delay
        }
    }

    /// Drive `op` to a terminal state: up to `max_attempts` calls with a
    /// classified wait between them and no wait after the last. On success
    /// the 1-based attempt count is reported alongside the value. Waits and
    /// in-flight attempts race against `cancel`.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), ExecutionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                outcome = op(attempt) => outcome,
            };

            match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(message) => {
                    last_error = message;
                    if attempt < self.max_attempts {
                        let delay = self.delay_after(&last_error);
                        warn!(
                            "Attempt {attempt}/{} failed: {last_error}; retrying in {delay:?}",
                            self.max_attempts
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }

        Err(ExecutionError::Generation(last_error))
    }
}
