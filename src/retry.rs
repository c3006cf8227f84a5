//! Bounded retry with jittered backoff.
//!
//! Every retry loop in the crate goes through [`retry`]: the caller supplies the
//! operation, a predicate deciding which errors are worth another attempt, and a
//! [`RetryPolicy`] with the attempt budget and delay shape.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },

    /// An attempt failed with an error the predicate refused to retry.
    #[error("{0}")]
    Failed(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Failed(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: usize,
    /// Upper bound of the uniformly random delay between attempts.
    pub max_jitter: Duration,
    /// Number of leading retries that run without any delay.
    pub immediate_retries: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, max_jitter: Duration) -> Self {
        Self {
            max_attempts,
            max_jitter,
            immediate_retries: 0,
        }
    }

    pub fn with_immediate_retries(mut self, immediate_retries: usize) -> Self {
        self.immediate_retries = immediate_retries;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: usize) -> Duration {
        if retry <= self.immediate_retries || self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = self.max_jitter.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Failed(e)),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }

                let delay = policy.delay(attempt);
                tracing::debug!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after retryable error"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
