//! Bounded retry with exponential backoff for broker operations.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{BrokerError, BrokerResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        self.run_while(operation, BrokerError::is_transient, op).await
    }

    /// Like [`run`](Self::run) for commands that must not be applied twice, such as counter
    /// changes. Only failures that never reached the server are retried.
    pub async fn run_non_idempotent<T, F, Fut>(
        &self,
        operation: &'static str,
        op: F,
    ) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        self.run_while(operation, BrokerError::is_unsent, op).await
    }

    async fn run_while<T, F, Fut>(
        &self,
        operation: &'static str,
        retryable: fn(&BrokerError) -> bool,
        mut op: F,
    ) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) && attempt < attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
