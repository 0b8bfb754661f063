//! Retry policy for exchange calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::{Error, Result};

/// Classification of a single call attempt.
#[derive(Debug)]
pub enum CallOutcome<T> {
    Success(T),
    /// Worth trying again: network failure, rate limit, exchange overload.
    Retryable(Error),
    Fatal(Error),
}

impl<T> From<Result<T>> for CallOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => CallOutcome::Success(value),
            Err(e) if e.is_retryable() => CallOutcome::Retryable(e),
            Err(e) => CallOutcome::Fatal(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// Exhaustion returns the last retryable error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match CallOutcome::from(op().await) {
                CallOutcome::Success(value) => return Ok(value),
                CallOutcome::Fatal(e) => return Err(e),
                CallOutcome::Retryable(e) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Retryable exchange error"
                    );
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(Error::Api {
            message: format!("{operation}: max retries exceeded"),
            status: None,
        }))
    }
}
