//! One gateway instance: the explicit context that owns every component.
//!
//! Nothing in the crate is global, so several instances can share one broker inside a
//! single process (the integration tests rely on this).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::InstanceSettings;
use crate::error::BrokerResult;
use crate::gateway::ConnectionGateway;
use crate::metrics::GatewayMetrics;
use crate::presence::PresenceCounter;
use crate::relay::{BroadcastRelay, RelayHandle, create_local_broadcast};
use crate::shutdown::{ReconcileReport, ShutdownReconciler};

pub struct GatewayInstance {
    broker: Arc<dyn Broker>,
    presence: Arc<PresenceCounter>,
    gateway: Arc<ConnectionGateway>,
    reconciler: ShutdownReconciler,
    relay: Mutex<Option<RelayHandle>>,
    live_channels: Vec<&'static str>,
    metrics: Arc<GatewayMetrics>,
    origin: String,
}

impl GatewayInstance {
    /// Initialize the counter, then start relaying. A failed initialization is fatal and
    /// nothing is left running.
    pub async fn start(broker: Arc<dyn Broker>, settings: InstanceSettings) -> BrokerResult<Self> {
        let metrics = Arc::new(GatewayMetrics::new());
        let presence = Arc::new(PresenceCounter::new(
            broker.clone(),
            settings.retry.clone(),
            metrics.clone(),
        ));
        let count = presence.initialize().await?;

        let local = create_local_broadcast(settings.outbound_capacity);
        let relay = Arc::new(BroadcastRelay::new(
            broker.clone(),
            local.clone(),
            settings.origin.clone(),
            settings.retry.clone(),
            metrics.clone(),
        ));
        let gateway = Arc::new(ConnectionGateway::new(
            presence.clone(),
            broker.clone(),
            settings.retry,
            local,
            relay.health(),
            metrics.clone(),
        ));

        let relay_handle = relay.start(CancellationToken::new()).await;
        let live_channels = relay_handle.live_channels().to_vec();

        info!(
            origin = %settings.origin,
            backend = broker.backend_name(),
            count,
            "Gateway instance started"
        );

        Ok(Self {
            reconciler: ShutdownReconciler::new(gateway.clone(), presence.clone()),
            broker,
            presence,
            gateway,
            relay: Mutex::new(Some(relay_handle)),
            live_channels,
            metrics,
            origin: settings.origin,
        })
    }

    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    pub fn presence(&self) -> &Arc<PresenceCounter> {
        &self.presence
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Channels the relay managed to subscribe to at startup.
    pub fn live_channels(&self) -> &[&'static str] {
        &self.live_channels
    }

    pub fn is_degraded(&self) -> bool {
        self.gateway.is_degraded()
    }

    /// Cancelled once shutdown has finished with the broker.
    pub fn closing_token(&self) -> CancellationToken {
        self.gateway.closing_token()
    }

    /// Reconcile the counter, stop relaying, close the broker and release live sessions.
    ///
    /// Reconciliation is bounded by `grace`; whatever happens, sessions are told to close.
    /// Returns the reconciliation report when it finished in time.
    pub async fn shutdown(&self, grace: Duration) -> Option<ReconcileReport> {
        info!(origin = %self.origin, "Shutting down gateway instance");

        let report = match tokio::time::timeout(grace, self.reconciler.reconcile()).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                error!(error = %e, "Shutdown reconciliation failed, count may be too high");
                None
            }
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Shutdown reconciliation timed out"
                );
                None
            }
        };

        if let Some(relay) = self.relay.lock().await.take() {
            relay.stop().await;
        }
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
        self.gateway.close_sessions();

        if let Some(report) = &report {
            info!(drained = report.drained, count = report.count, "Gateway instance stopped");
        }
        report
    }
}
