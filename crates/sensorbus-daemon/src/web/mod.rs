//! Prometheus exposition endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;

use sensorbus_core::MetricRegistry;

/// Content type of the Prometheus text exposition format.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Creates the web router with all routes.
pub fn create_router(registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(registry)
}

/// GET /metrics - Current registry snapshot
async fn metrics(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match registry.encode_text() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// GET /health - Liveness check
async fn health() -> &'static str {
    "ok"
}
