use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DavError;

/// Default number of attempts per chunk
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Bounded retry with capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError {
    /// Attempts exhausted, or the error was local and would fail again
    Failed { attempts: u32, source: DavError },
    /// Cancellation was observed between attempts
    Cancelled { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn without_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Pause after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, the attempt budget is spent, or `cancel` fires
    /// while waiting to retry. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DavError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_attempts || !err.is_retryable() {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay_for(attempt);
            warn!(attempt, max_attempts, ?delay, error = %err, "attempt failed, retrying");

            if delay.is_zero() {
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            attempt += 1;
        }
    }
}
