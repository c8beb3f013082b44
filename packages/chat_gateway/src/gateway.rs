//! Local session ownership.
//!
//! Turns transport-level events for sessions attached to this instance into presence
//! counter changes and broker publishes. The gateway never writes to its own sessions:
//! everything a client sees arrives through the relay, including its own messages.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, NEW_MESSAGE_CHANNEL};
use crate::error::{BrokerError, CounterError, GatewayError};
use crate::metrics::GatewayMetrics;
use crate::presence::PresenceCounter;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::relay::{LocalBroadcast, RelayHealth};
use crate::retry::RetryPolicy;

pub type SessionId = Uuid;

#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
        }
    }
}

/// A connected session plus its stream of outbound events.
pub struct SessionHandle {
    pub session: ConnectionSession,
    pub events: broadcast::Receiver<ServerEvent>,
}

pub struct ConnectionGateway {
    presence: Arc<PresenceCounter>,
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    local: LocalBroadcast,
    relay_health: Arc<RelayHealth>,
    sessions: RwLock<HashMap<SessionId, ConnectionSession>>,
    /// Held shared by counter changes in flight, exclusively by `drain`.
    admission: RwLock<()>,
    /// Sessions attached to this instance; read by shutdown reconciliation.
    connected_clients: AtomicU64,
    /// Departed sessions whose decrement failed and is still owed to the counter.
    pending_decrements: AtomicU64,
    accepting: AtomicBool,
    degraded: AtomicBool,
    /// Cancelled once the instance shuts down; live sessions close on it.
    closing: CancellationToken,
    metrics: Arc<GatewayMetrics>,
}

impl ConnectionGateway {
    pub fn new(
        presence: Arc<PresenceCounter>,
        broker: Arc<dyn Broker>,
        retry: RetryPolicy,
        local: LocalBroadcast,
        relay_health: Arc<RelayHealth>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            presence,
            broker,
            retry,
            local,
            relay_health,
            sessions: RwLock::new(HashMap::new()),
            admission: RwLock::new(()),
            connected_clients: AtomicU64::new(0),
            pending_decrements: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            degraded: AtomicBool::new(false),
            closing: CancellationToken::new(),
            metrics,
        }
    }

    /// Attach a new session and count it fleet-wide.
    ///
    /// When the increment does not reach the broker the session is rolled back, the
    /// instance turns degraded and the caller should close the transport. When it lands but
    /// the new count cannot be announced, the session stays attached (it is counted) and
    /// the instance turns degraded.
    pub async fn connect(&self) -> Result<SessionHandle, GatewayError> {
        if !self.is_accepting() {
            self.metrics.connection_rejected();
            return Err(GatewayError::ShuttingDown);
        }
        if self.is_degraded() {
            self.metrics.connection_rejected();
            return Err(GatewayError::Degraded);
        }

        // Drain waits for this guard, so it never misses a session whose increment is
        // still in flight. Re-check once inside it: a drain may have finished meanwhile.
        let _admission = self.admission.read().await;
        if !self.is_accepting() {
            self.metrics.connection_rejected();
            return Err(GatewayError::ShuttingDown);
        }

        let session = ConnectionSession::new();
        // Subscribe before counting so the session sees its own count update.
        let events = self.subscribe();
        self.sessions.write().await.insert(session.id, session.clone());
        self.connected_clients.fetch_add(1, Ordering::SeqCst);

        match self.presence.increment().await {
            Ok(count) => {
                self.mark_healthy();
                self.metrics.connection_opened();
                info!(session_id = %session.id, count, "Client connected");
                Ok(SessionHandle { session, events })
            }
            Err(CounterError::NotAnnounced { count, source }) => {
                self.mark_degraded(&source);
                self.metrics.connection_opened();
                warn!(session_id = %session.id, count, "Client connected, count update not announced");
                Ok(SessionHandle { session, events })
            }
            Err(CounterError::NotApplied(e)) => {
                if self.release(session.id).await.is_some() {
                    debug!(session_id = %session.id, "Rolled back session after failed increment");
                }
                self.mark_degraded(&e);
                self.metrics.connection_rejected();
                Err(e.into())
            }
        }
    }

    /// Handle a raw inbound frame from a session.
    ///
    /// Invalid frames are dropped without telling the sender. Valid messages are published
    /// to the broker and are not emitted locally. Returns whether anything was published.
    pub async fn handle_client_event(
        &self,
        session_id: SessionId,
        raw: &str,
    ) -> Result<bool, GatewayError> {
        let event = match ClientEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Dropping client event");
                self.metrics.client_event_dropped();
                return Ok(false);
            }
        };

        match event {
            ClientEvent::NewMessage { message } => {
                let published = self
                    .retry
                    .run("PUBLISH", || self.broker.publish(NEW_MESSAGE_CHANNEL, &message))
                    .await;
                if let Err(e) = published {
                    self.metrics.broker_error();
                    self.mark_degraded(&e);
                    return Err(e.into());
                }
                self.metrics.message_published();
                debug!(session_id = %session_id, "Published chat message");
                Ok(true)
            }
        }
    }

    /// Detach a session after a client-initiated disconnect.
    ///
    /// Idempotent: sessions that are unknown or were already drained by shutdown are not
    /// counted again. Returns the new fleet count when a decrement happened.
    ///
    /// Decrements that fail are kept as pending. The next disconnect retries them together
    /// with its own, and shutdown reconciliation includes whatever is still owed.
    pub async fn disconnect(&self, session_id: SessionId) -> Result<Option<i64>, GatewayError> {
        let _admission = self.admission.read().await;
        let Some(session) = self.release(session_id).await else {
            debug!(session_id = %session_id, "Session already released");
            return Ok(None);
        };
        self.metrics.connection_closed();

        let owed = self.pending_decrements.swap(0, Ordering::SeqCst) + 1;
        let count = match self.presence.decrement_by(owed).await {
            Ok(count) => {
                self.mark_healthy();
                count
            }
            Err(CounterError::NotAnnounced { count, source }) => {
                self.mark_degraded(&source);
                count
            }
            Err(CounterError::NotApplied(e)) => {
                self.pending_decrements.fetch_add(owed, Ordering::SeqCst);
                warn!(session_id = %session_id, owed, "Decrement failed, keeping it pending");
                self.mark_degraded(&e);
                return Err(e.into());
            }
        };

        let connected_for = Utc::now() - session.connected_at;
        info!(
            session_id = %session_id,
            count,
            connected_secs = connected_for.num_seconds(),
            "Client disconnected"
        );
        Ok(Some(count))
    }

    /// Stop accepting sessions and forget every attached one without decrementing.
    ///
    /// Waits for counter changes already in flight. Returns how many decrements the fleet
    /// counter is owed: every attached session plus pending failed decrements. Later
    /// `disconnect` calls for drained sessions are no-ops, so reconciliation is the only
    /// decrement they get.
    pub async fn drain(&self) -> u64 {
        let _admission = self.admission.write().await;
        self.accepting.store(false, Ordering::SeqCst);
        self.sessions.write().await.clear();
        let attached = self.connected_clients.swap(0, Ordering::SeqCst);
        self.metrics.connections_drained(attached);
        attached + self.pending_decrements.swap(0, Ordering::SeqCst)
    }

    /// A fresh receiver of the events relayed to this instance.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.local.subscribe()
    }

    async fn release(&self, session_id: SessionId) -> Option<ConnectionSession> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(&session_id);
        if removed.is_some() {
            self.connected_clients.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    fn mark_degraded(&self, err: &BrokerError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(error = %err, "Broker unavailable, instance is degraded and refuses new sessions");
            self.metrics.degraded();
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Broker reachable again, accepting new sessions");
        }
    }

    pub fn connected_clients(&self) -> u64 {
        self.connected_clients.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Degraded after a failed broker operation, or while a relay channel is down.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst) || !self.relay_health.is_healthy()
    }

    /// Failed decrements not yet applied to the fleet counter.
    pub fn pending_decrements(&self) -> u64 {
        self.pending_decrements.load(Ordering::SeqCst)
    }

    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Tell live sessions to close their transports.
    pub fn close_sessions(&self) {
        self.closing.cancel();
    }
}
