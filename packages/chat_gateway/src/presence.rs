//! Fleet-wide presence counter.
//!
//! The counter lives in the broker under [`CONNECTION_COUNT_KEY`]. Every successful change
//! is followed by a publish of the new value on [`CONNECTION_COUNT_UPDATED_CHANNEL`], so
//! every instance (this one included) learns about it through its relay.
//!
//! Counter changes are not idempotent, so they are only retried when the broker certainly
//! never saw them. A change that landed but could not be announced is reported as
//! [`CounterError::NotAnnounced`] so callers keep their bookkeeping in step with the broker.

use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::{Broker, CONNECTION_COUNT_KEY, CONNECTION_COUNT_UPDATED_CHANNEL};
use crate::error::{BrokerResult, CounterError};
use crate::metrics::GatewayMetrics;
use crate::retry::RetryPolicy;

pub struct PresenceCounter {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    metrics: Arc<GatewayMetrics>,
}

impl PresenceCounter {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            broker,
            retry,
            metrics,
        }
    }

    /// Create the counter at zero unless it already exists. Returns the current value.
    pub async fn initialize(&self) -> BrokerResult<i64> {
        let created = self
            .track(
                self.retry
                    .run("SETNX", || self.broker.set_if_absent(CONNECTION_COUNT_KEY, 0))
                    .await,
            )?;
        let count = self.current().await?;
        if created {
            info!(key = CONNECTION_COUNT_KEY, "Initialized connection count");
        } else {
            info!(
                key = CONNECTION_COUNT_KEY,
                count, "Connection count already present, keeping it"
            );
        }
        Ok(count)
    }

    pub async fn current(&self) -> BrokerResult<i64> {
        let value = self.track(
            self.retry
                .run("GET", || self.broker.get(CONNECTION_COUNT_KEY))
                .await,
        )?;
        Ok(value.unwrap_or(0))
    }

    pub async fn increment(&self) -> Result<i64, CounterError> {
        let count = self
            .track(
                self.retry
                    .run_non_idempotent("INCR", || self.broker.incr(CONNECTION_COUNT_KEY))
                    .await,
            )
            .map_err(CounterError::NotApplied)?;
        self.announce(count).await?;
        Ok(count)
    }

    pub async fn decrement(&self) -> Result<i64, CounterError> {
        self.decrement_by(1).await
    }

    /// Subtract `n`, clamped at zero. `n == 0` reads the value without publishing.
    pub async fn decrement_by(&self, n: u64) -> Result<i64, CounterError> {
        if n == 0 {
            return self.current().await.map_err(CounterError::NotApplied);
        }
        let by = i64::try_from(n).unwrap_or(i64::MAX);
        let count = self
            .track(
                self.retry
                    .run_non_idempotent("DECRBY", || {
                        self.broker.decr_clamped(CONNECTION_COUNT_KEY, by)
                    })
                    .await,
            )
            .map_err(CounterError::NotApplied)?;
        self.announce(count).await?;
        Ok(count)
    }

    async fn announce(&self, count: i64) -> Result<(), CounterError> {
        let payload = count.to_string();
        self.track(
            self.retry
                .run("PUBLISH", || {
                    self.broker
                        .publish(CONNECTION_COUNT_UPDATED_CHANNEL, &payload)
                })
                .await,
        )
        .map_err(|source| CounterError::NotAnnounced { count, source })?;
        debug!(count, "Announced connection count");
        Ok(())
    }

    fn track<T>(&self, result: BrokerResult<T>) -> BrokerResult<T> {
        if result.is_err() {
            self.metrics.broker_error();
        }
        result
    }
}
