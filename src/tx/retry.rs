//! Bounded retry with fixed or exponential delay

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{RelayerError, RelayerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Doubles after every attempt, capped at `max`
    Exponential { max: Duration },
}

/// How many times to call an operation and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            interval: initial,
            backoff: Backoff::Exponential { max },
        }
    }

    /// Delay after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }

    /// Call `op` until it succeeds or the attempts run out, returning the
    /// last error in that case.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> RelayerResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(
                        "{} failed (attempt {}/{}): {}",
                        operation, attempt, max_attempts, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(RelayerError::Timeout {
            operation: operation.to_string(),
        }))
    }
}
