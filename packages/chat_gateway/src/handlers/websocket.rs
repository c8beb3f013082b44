use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;
use crate::ws;

/// Chat WebSocket - refused before the upgrade while degraded or shutting down
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let gateway = state.instance.gateway().clone();
    if !gateway.is_accepting() || gateway.is_degraded() {
        state.instance.metrics().connection_rejected();
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let metrics = state.instance.metrics().clone();
    ws.on_upgrade(move |socket| async move {
        let session = match gateway.connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Refusing session");
                return;
            }
        };
        ws::handle_session(socket, session, gateway, metrics).await;
    })
}
