use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::gateway::{ConnectionGateway, SessionHandle};
use crate::metrics::GatewayMetrics;
use crate::protocol::ServerEvent;

/// Outbound frames buffered per socket before the writer applies backpressure.
const SEND_CHANNEL_CAPACITY: usize = 64;

/// Drive one connected session until the client leaves or the instance closes.
pub async fn handle_session(
    socket: WebSocket,
    session: SessionHandle,
    gateway: Arc<ConnectionGateway>,
    metrics: Arc<GatewayMetrics>,
) {
    let SessionHandle {
        session,
        events: mut events_rx,
    } = session;
    let session_id = session.id;
    let closing = gateway.closing_token();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(SEND_CHANNEL_CAPACITY);

    // Relayed events for this instance
    let metrics_events = metrics.clone();
    let events_task = async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    metrics_events.events_lagged(n);
                    warn!(session_id = %session_id, "Session lagged, dropped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    // Task to send messages to WebSocket
    let metrics_sender = metrics.clone();
    let sender_task = async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            metrics_sender.event_sent();
        }
        if let Err(e) = ws_sender.close().await {
            debug!(session_id = %session_id, "WebSocket close failed: {}", e);
        }
    };

    // Task to handle incoming messages
    let gateway_input = gateway.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = gateway_input.handle_client_event(session_id, &text).await {
                        warn!(session_id = %session_id, error = %e, "Failed to publish message");
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(session_id = %session_id, "Client closed connection");
                    break;
                }
                Err(e) => {
                    debug!(session_id = %session_id, "WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = events_task => debug!("Event task ended"),
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
        _ = closing.cancelled() => debug!(session_id = %session_id, "Instance closing, dropping session"),
    }

    // No-op for sessions already drained by shutdown.
    if let Err(e) = gateway.disconnect(session_id).await {
        warn!(session_id = %session_id, error = %e, "Failed to remove session from the count");
    }
}
