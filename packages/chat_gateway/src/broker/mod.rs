//! Shared broker abstraction.
//!
//! Every instance in the fleet talks to the same broker. It provides two things:
//! - an atomic integer counter under a fixed key (the presence counter)
//! - named pub/sub channels with per-channel FIFO delivery to all subscribers
//!
//! Two backends implement [`Broker`]:
//! - [`RedisBroker`] for real deployments (`redis://`, `rediss://`, `redis+unix://`)
//! - [`MemoryBroker`] for tests and single-node development (`memory://`)

mod memory;
mod redis_broker;

pub use self::memory::MemoryBroker;
pub use self::redis_broker::RedisBroker;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::{BrokerError, BrokerResult};

/// Counter key holding the fleet-wide number of connected clients.
pub const CONNECTION_COUNT_KEY: &str = "chat:connection-count";
/// Channel carrying every new counter value as a stringified integer.
pub const CONNECTION_COUNT_UPDATED_CHANNEL: &str = "chat:connection-count-updated";
/// Channel carrying raw chat message strings.
pub const NEW_MESSAGE_CHANNEL: &str = "chat:new-message";

/// A payload delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Ordered stream of messages for one channel.
pub type Subscription = BoxStream<'static, BrokerMessage>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Read a counter. `None` when the key does not exist.
    async fn get(&self, key: &str) -> BrokerResult<Option<i64>>;

    /// Set a counter only if it does not exist yet. Returns whether it was created.
    async fn set_if_absent(&self, key: &str, value: i64) -> BrokerResult<bool>;

    /// Atomically add one and return the new value.
    async fn incr(&self, key: &str) -> BrokerResult<i64>;

    /// Atomically subtract `by`, never going below zero. Returns the new value.
    async fn decr_clamped(&self, key: &str, by: i64) -> BrokerResult<i64>;

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()>;

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription>;

    /// Release the command connection. Later calls fail with [`BrokerError::Closed`].
    async fn close(&self) -> BrokerResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Connect to the broker named by `url`.
pub async fn connect(url: &str) -> BrokerResult<Arc<dyn Broker>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    if ["redis://", "rediss://", "redis+unix://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        return Ok(Arc::new(RedisBroker::connect(url).await?));
    }
    Err(BrokerError::UnsupportedUrl(url.to_string()))
}
