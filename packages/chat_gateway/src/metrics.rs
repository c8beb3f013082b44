//! Gateway metrics for observability
//!
//! Per-instance runtime counters. Nothing here is shared across the fleet.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // Connection metrics
    /// Sessions currently attached to this instance
    pub active_connections: AtomicU64,
    /// Sessions accepted since start
    pub total_connections: AtomicU64,
    /// Sessions refused (degraded, shutting down, or broker failure)
    pub rejected_connections: AtomicU64,

    // Message metrics
    /// Chat messages published to the broker
    pub messages_published: AtomicU64,
    /// Inbound client events dropped by validation
    pub client_events_dropped: AtomicU64,
    /// Broker payloads fanned out to local sessions
    pub payloads_relayed: AtomicU64,
    /// Broker payloads rejected by validation
    pub payloads_rejected: AtomicU64,
    /// Outbound events written to sockets
    pub events_sent: AtomicU64,
    /// Outbound events lost because a session fell behind
    pub events_lagged: AtomicU64,

    // Error metrics
    /// Broker operations that failed after retries
    pub broker_errors: AtomicU64,
    /// Times the instance entered degraded mode
    pub degraded_transitions: AtomicU64,

    start_time: Option<Instant>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Sessions dropped in bulk by shutdown reconciliation.
    pub fn connections_drained(&self, n: u64) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| {
                Some(active.saturating_sub(n))
            });
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_event_dropped(&self) {
        self.client_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payload_relayed(&self) {
        self.payloads_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payload_rejected(&self) {
        self.payloads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_lagged(&self, n: u64) {
        self.events_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn degraded(&self) {
        self.degraded_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                rejected: self.rejected_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                client_events_dropped: self.client_events_dropped.load(Ordering::Relaxed),
                relayed: self.payloads_relayed.load(Ordering::Relaxed),
                rejected: self.payloads_rejected.load(Ordering::Relaxed),
                sent: self.events_sent.load(Ordering::Relaxed),
                lagged: self.events_lagged.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                broker: self.broker_errors.load(Ordering::Relaxed),
                degraded_transitions: self.degraded_transitions.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub published: u64,
    pub client_events_dropped: u64,
    pub relayed: u64,
    pub rejected: u64,
    pub sent: u64,
    pub lagged: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub broker: u64,
    pub degraded_transitions: u64,
}
