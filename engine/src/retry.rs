//! Fixed-delay retry policy shared by extraction, lookups and delivery.

use std::future::Future;
use std::time::Duration;

use sync_config::shared::RetryConfig;
use tokio::time::sleep;
use tracing::warn;

use crate::error::SyncResult;

/// Retries an operation a bounded number of times with a fixed delay between attempts.
///
/// Only errors whose kind is retryable are retried; data and configuration errors are returned
/// on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Policy without any delay, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.delay_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `f` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind().is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %err.summary(),
                        "operation failed, retrying after delay"
                    );

                    if !self.delay.is_zero() {
                        sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
