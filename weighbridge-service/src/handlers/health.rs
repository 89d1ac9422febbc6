use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use service_core::response::Envelope;

/// Liveness: the process is up and serving.
pub async fn health_check() -> impl IntoResponse {
    Envelope::ok(json!({
        "status": "ok",
        "service": "weighbridge-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness: the database answers.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            Envelope::ok(json!({ "status": "ready" })).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed - database unavailable");
            service_core::error::AppError::ServiceUnavailable.into_response()
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        get_metrics(),
    )
}
