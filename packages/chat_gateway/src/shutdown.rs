//! Shutdown reconciliation.
//!
//! A terminating instance drops its sessions without running per-session disconnects, so
//! the fleet counter would keep counting them forever. The reconciler subtracts them in
//! one clamped step.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{BrokerResult, CounterError};
use crate::gateway::ConnectionGateway;
use crate::presence::PresenceCounter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Decrements owed when shutdown began: attached sessions plus failed disconnects.
    pub drained: u64,
    /// Fleet count after the subtraction.
    pub count: i64,
}

pub struct ShutdownReconciler {
    gateway: Arc<ConnectionGateway>,
    presence: Arc<PresenceCounter>,
}

impl ShutdownReconciler {
    pub fn new(gateway: Arc<ConnectionGateway>, presence: Arc<PresenceCounter>) -> Self {
        Self { gateway, presence }
    }

    /// Drain local sessions and subtract them from the fleet counter.
    ///
    /// Safe to call more than once: a second call finds nothing left to drain.
    pub async fn reconcile(&self) -> BrokerResult<ReconcileReport> {
        let drained = self.gateway.drain().await;
        if drained == 0 {
            info!("No clients attached, leaving the count untouched");
            let count = self.presence.current().await?;
            return Ok(ReconcileReport { drained, count });
        }

        info!("Removing {} clients from the count", drained);
        match self.presence.decrement_by(drained).await {
            Ok(count) => Ok(ReconcileReport { drained, count }),
            Err(CounterError::NotAnnounced { count, source }) => {
                warn!(count, error = %source, "Count reconciled but not announced");
                Ok(ReconcileReport { drained, count })
            }
            Err(CounterError::NotApplied(e)) => {
                warn!(drained, error = %e, "Failed to remove drained clients from the count");
                Err(e)
            }
        }
    }
}
