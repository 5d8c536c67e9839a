use std::future::Future;
use std::time;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Returned when every connect attempt allowed by a `ConnectRetryPolicy` failed.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: E,
    },
    #[error("{operation} was cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },
}

#[derive(Copy, Clone, Debug)]
/// The retry policy used while establishing a connection to the queue transport.
pub struct ConnectRetryPolicy {
    /// Total number of attempts, including the first one.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt. 1 means a fixed delay.
    backoff_coefficient: u32,
    /// The wait after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible wait between attempts.
    maximum_interval: Option<time::Duration>,
}

impl ConnectRetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Calculate the wait after `attempt` (1-based) failed.
    pub fn time_until_next_attempt(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Run `attempt` until it succeeds, a non-retryable error comes back, attempts run out, or
    /// `shutdown` is cancelled while waiting between attempts.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        shutdown: &CancellationToken,
        is_retryable: impl Fn(&E) -> bool,
        mut attempt: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            let error = match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) || attempts >= self.max_attempts {
                error!(operation, attempts, "giving up: {}", error);
                return Err(RetryError::Exhausted {
                    operation: operation.to_owned(),
                    attempts,
                    last_error: error,
                });
            }

            let wait = self.time_until_next_attempt(attempts);
            warn!(
                operation,
                attempts,
                remaining = self.max_attempts - attempts,
                wait_ms = wait.as_millis() as u64,
                "attempt failed, retrying: {}", error
            );
            metrics::counter!("connect_retries_total", "operation" => operation.to_owned())
                .increment(1);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_owned(),
                        attempts,
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 1,
            initial_interval: time::Duration::from_secs(5),
            maximum_interval: None,
        }
    }
}
