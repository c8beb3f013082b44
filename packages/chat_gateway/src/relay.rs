//! Broker → local session relay.
//!
//! The relay only consumes from the broker and only emits to sessions attached to this
//! instance. It never publishes, so there is no feedback loop, and it never filters by
//! origin, so a sender's own instance echoes its messages like any other.

use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, CONNECTION_COUNT_UPDATED_CHANNEL, NEW_MESSAGE_CHANNEL, Subscription};
use crate::metrics::GatewayMetrics;
use crate::protocol::{ChannelMessage, ChannelPayload, ServerEvent};
use crate::retry::RetryPolicy;

/// The two channels every instance listens on.
pub const RELAY_CHANNELS: [&str; 2] = [CONNECTION_COUNT_UPDATED_CHANNEL, NEW_MESSAGE_CHANNEL];

/// Local fan-out queue shared by every session on one instance.
pub type LocalBroadcast = broadcast::Sender<ServerEvent>;

/// Create the local fan-out queue. Sessions further behind than `capacity` lose the oldest
/// events.
pub fn create_local_broadcast(capacity: usize) -> LocalBroadcast {
    let (tx, _) = broadcast::channel(capacity.max(1));
    tx
}

/// Relay channels currently without a live subscription.
#[derive(Debug, Default)]
pub struct RelayHealth {
    channels_down: AtomicUsize,
}

impl RelayHealth {
    pub fn is_healthy(&self) -> bool {
        self.channels_down() == 0
    }

    pub fn channels_down(&self) -> usize {
        self.channels_down.load(Ordering::SeqCst)
    }

    fn channel_down(&self) {
        self.channels_down.fetch_add(1, Ordering::SeqCst);
    }

    fn channel_up(&self) {
        let _ = self
            .channels_down
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

pub struct BroadcastRelay {
    broker: Arc<dyn Broker>,
    local: LocalBroadcast,
    /// Tag stamped on every message this instance relays.
    origin: String,
    /// Backoff between resubscribe attempts.
    retry: RetryPolicy,
    health: Arc<RelayHealth>,
    metrics: Arc<GatewayMetrics>,
}

impl BroadcastRelay {
    pub fn new(
        broker: Arc<dyn Broker>,
        local: LocalBroadcast,
        origin: String,
        retry: RetryPolicy,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            broker,
            local,
            origin,
            retry,
            health: Arc::new(RelayHealth::default()),
            metrics,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn health(&self) -> Arc<RelayHealth> {
        self.health.clone()
    }

    /// Handle one broker payload. Returns the number of local sessions it reached.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let event = match ChannelPayload::parse(channel, payload) {
            Ok(ChannelPayload::CountUpdated(count)) => ServerEvent::ConnectionCountUpdated { count },
            Ok(ChannelPayload::NewMessage(content)) => {
                ServerEvent::NewMessage(ChannelMessage::new(content, &self.origin))
            }
            Err(e) => {
                warn!(channel, error = %e, "Dropping malformed broker payload");
                self.metrics.payload_rejected();
                return 0;
            }
        };

        self.metrics.payload_relayed();
        // Err only means no session is attached right now.
        let reached = self.local.send(event).unwrap_or(0);
        debug!(channel, sessions = reached, "Relayed broker payload");
        reached
    }

    /// Subscribe to both relay channels and spawn one task per channel.
    ///
    /// A failed subscription is logged and skipped: the instance keeps running without that
    /// stream and the channel task keeps resubscribing in the background. The same happens
    /// when a live subscription ends. While any channel is down the relay reports unhealthy.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> RelayHandle {
        let mut live_channels = Vec::new();
        let mut tasks = Vec::new();

        for channel in RELAY_CHANNELS {
            let subscription = match self.broker.subscribe(channel).await {
                Ok(s) => {
                    info!(channel, "Subscribed to broker channel");
                    live_channels.push(channel);
                    Some(s)
                }
                Err(e) => {
                    error!(channel, error = %e, "Failed to subscribe, continuing without this stream");
                    self.metrics.broker_error();
                    self.health.channel_down();
                    None
                }
            };
            tasks.push(tokio::spawn(
                self.clone().run_channel(channel, subscription, cancel.clone()),
            ));
        }

        RelayHandle {
            live_channels,
            tasks,
            cancel,
        }
    }

    /// Pump one channel until cancelled, resubscribing with backoff whenever it is down.
    async fn run_channel(
        self: Arc<Self>,
        channel: &'static str,
        mut subscription: Option<Subscription>,
        cancel: CancellationToken,
    ) {
        let mut attempt = 0;
        loop {
            let mut stream = match subscription.take() {
                Some(stream) => stream,
                None => {
                    attempt += 1;
                    let delay = self.retry.backoff_for(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match self.broker.subscribe(channel).await {
                        Ok(stream) => {
                            info!(channel, attempt, "Resubscribed to broker channel");
                            self.health.channel_up();
                            attempt = 0;
                            stream
                        }
                        Err(e) => {
                            warn!(channel, attempt, error = %e, "Resubscribe failed");
                            self.metrics.broker_error();
                            continue;
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => match next {
                        Some(msg) => {
                            self.dispatch(&msg.channel, &msg.payload);
                        }
                        None => break,
                    },
                }
            }
            warn!(channel, "Broker subscription ended, resubscribing");
            self.health.channel_down();
        }
    }
}

/// Running relay subscriptions.
pub struct RelayHandle {
    live_channels: Vec<&'static str>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RelayHandle {
    pub fn live_channels(&self) -> &[&'static str] {
        &self.live_channels
    }

    /// Stop every relay task and drop the subscriptions.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay task ended abnormally");
            }
        }
        info!("Relay stopped");
    }
}
