//! Chat gateway
//!
//! A WebSocket chat server meant to run as many identical instances behind a load
//! balancer. Instances share a fleet-wide connection count and a message stream through a
//! pub/sub broker (Redis in production, an in-process broker for tests and local runs).

use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

pub mod broker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod instance;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod shutdown;
mod ws;

#[cfg(test)]
mod test_helpers;

pub use instance::GatewayInstance;

#[derive(Clone)]
pub struct AppState {
    pub instance: Arc<GatewayInstance>,
    /// Listen port, reported by the health check.
    pub port: u16,
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Build the HTTP surface. Only `cors_origin` may make cross-origin requests.
pub fn create_router(state: AppState, cors_origin: HeaderValue) -> Router {
    Router::new()
        .route("/healthcheck", get(handlers::healthcheck_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ws", get(handlers::websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list([cors_origin]))
                .allow_methods([Method::GET]),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_app_state;
    use axum::body::Body;
    use axum::http::{Request, header};
    use tower::ServiceExt;

    fn router(state: AppState) -> Router {
        create_router(state, HeaderValue::from_static("http://localhost:3000"))
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_only() {
        let (state, _broker) = test_app_state(3001).await;

        let resp = router(state.clone())
            .oneshot(
                Request::get("/healthcheck")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );

        let resp = router(state)
            .oneshot(
                Request::get("/healthcheck")
                    .header(header::ORIGIN, "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
