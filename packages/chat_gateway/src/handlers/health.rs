use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub port: u16,
}

/// Health check endpoint - 503 while the instance cannot reach the broker
pub async fn healthcheck_handler(State(state): State<AppState>) -> Response {
    if state.instance.is_degraded() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "degraded".to_string(),
                port: state.port,
            }),
        )
            .into_response();
    }

    Json(HealthStatus {
        status: "ok".to_string(),
        port: state.port,
    })
    .into_response()
}

/// Metrics endpoint - returns this instance's counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.instance.metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_app_state;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/healthcheck", get(healthcheck_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthcheck_reports_port() {
        let (state, _broker) = test_app_state(3001).await;
        let (status, json) = get_json(app(state), "/healthcheck").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"status": "ok", "port": 3001}));
    }

    #[tokio::test]
    async fn test_healthcheck_degraded() {
        let (state, broker) = test_app_state(3002).await;
        broker.fail_next_commands(10);
        assert!(state.instance.gateway().connect().await.is_err());

        let (status, json) = get_json(app(state), "/healthcheck").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["port"], 3002);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let (state, _broker) = test_app_state(3001).await;
        state.instance.gateway().connect().await.unwrap();

        let (status, json) = get_json(app(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connections"]["active"], 1);
        assert_eq!(json["connections"]["total"], 1);
    }
}
