use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::AppState;
use crate::broker::MemoryBroker;
use crate::config::InstanceSettings;
use crate::instance::GatewayInstance;
use crate::protocol::ServerEvent;
use crate::retry::RetryPolicy;

/// Instance settings with millisecond backoff so failure tests stay fast.
pub fn fast_settings(origin: &str) -> InstanceSettings {
    InstanceSettings {
        origin: origin.to_string(),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
        outbound_capacity: 16,
    }
}

/// Build an `AppState` around a started instance on a fresh in-memory broker.
///
/// The returned broker shares the instance's link, so fault injection on it affects the
/// instance.
pub async fn test_app_state(port: u16) -> (AppState, MemoryBroker) {
    let broker = MemoryBroker::new();
    let instance = GatewayInstance::start(Arc::new(broker.clone()), fast_settings(&port.to_string()))
        .await
        .expect("instance start");
    let state = AppState {
        instance: Arc::new(instance),
        port,
    };
    (state, broker)
}

pub async fn next_event(rx: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("local broadcast closed")
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
