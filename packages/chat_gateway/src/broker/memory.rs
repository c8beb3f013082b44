//! In-process broker.
//!
//! All handles created from one `MemoryBroker` share the same counters and channels, so
//! several gateway instances can run against one "fleet" inside a single process. Each
//! handle has its own link state (closed flag, injected faults), which lets a test break
//! one instance's broker connection without affecting the others.
//!
//! Not durable and not shared across processes.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Broker, BrokerMessage, Subscription};
use crate::error::{BrokerError, BrokerResult};

/// Per-channel buffer. Subscribers further behind than this lose the oldest payloads.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Shared {
    counters: Mutex<HashMap<String, i64>>,
    channels: Mutex<HashMap<String, broadcast::Sender<BrokerMessage>>>,
}

#[derive(Default)]
struct Link {
    closed: AtomicBool,
    /// Number of upcoming commands that fail before reaching the shared state.
    injected_failures: AtomicU32,
    failing_commands: Mutex<HashSet<&'static str>>,
    failing_subscriptions: Mutex<HashSet<String>>,
    /// Cancelled to end every subscription opened through this link so far.
    severed: Mutex<CancellationToken>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new connection to the same shared state, with its own link.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            link: Arc::new(Link::default()),
        }
    }

    /// Make the next `n` commands on this handle fail without being applied.
    pub fn fail_next_commands(&self, n: u32) {
        self.link.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Make every `command` (`"INCR"`, `"DECRBY"`, `"PUBLISH"`, ...) on this handle fail
    /// until [`restore_commands`](Self::restore_commands).
    pub async fn fail_command(&self, command: &'static str) {
        self.link.failing_commands.lock().await.insert(command);
    }

    pub async fn restore_commands(&self) {
        self.link.failing_commands.lock().await.clear();
    }

    /// Make every subscribe to `channel` on this handle fail.
    pub async fn fail_subscriptions_to(&self, channel: &str) {
        self.link
            .failing_subscriptions
            .lock()
            .await
            .insert(channel.to_string());
    }

    pub async fn restore_subscriptions(&self) {
        self.link.failing_subscriptions.lock().await.clear();
    }

    /// End every subscription opened through this handle, as a dropped pub/sub
    /// connection would. Later subscriptions are unaffected.
    pub async fn sever_subscriptions(&self) {
        let mut severed = self.link.severed.lock().await;
        severed.cancel();
        *severed = CancellationToken::new();
    }

    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    async fn check(&self, command: &'static str) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let injected = self
            .link
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.link.failing_commands.lock().await.contains(command) {
            return Err(BrokerError::Connection(format!("injected {command} failure")));
        }
        Ok(())
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<BrokerMessage> {
        self.shared
            .channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get(&self, key: &str) -> BrokerResult<Option<i64>> {
        self.check("GET").await?;
        Ok(self.shared.counters.lock().await.get(key).copied())
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> BrokerResult<bool> {
        self.check("SETNX").await?;
        let mut counters = self.shared.counters.lock().await;
        if counters.contains_key(key) {
            return Ok(false);
        }
        counters.insert(key.to_string(), value);
        Ok(true)
    }

    async fn incr(&self, key: &str) -> BrokerResult<i64> {
        self.check("INCR").await?;
        let mut counters = self.shared.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn decr_clamped(&self, key: &str, by: i64) -> BrokerResult<i64> {
        self.check("DECRBY").await?;
        let mut counters = self.shared.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value = (*value - by).max(0);
        Ok(*value)
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<()> {
        self.check("PUBLISH").await?;
        // No subscribers is not an error for pub/sub.
        let _ = self.sender(channel).await.send(BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if self.link.failing_subscriptions.lock().await.contains(channel) {
            return Err(BrokerError::Subscribe {
                channel: channel.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let rx = self.sender(channel).await.subscribe();
        let severed = self.link.severed.lock().await.clone();
        let channel = channel.to_string();
        let stream = futures::stream::unfold((rx, severed), move |(mut rx, severed)| {
            let channel = channel.clone();
            async move {
                loop {
                    let next = tokio::select! {
                        _ = severed.cancelled() => return None,
                        next = rx.recv() => next,
                    };
                    match next {
                        Ok(msg) => return Some((msg, (rx, severed))),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(channel = %channel, skipped = n, "Memory subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.link.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
