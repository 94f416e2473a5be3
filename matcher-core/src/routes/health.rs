use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use matcher_shared::{HealthCheck, HealthResponse, HealthStatus};

use crate::AppState;

/// Probes the Store (a single `SELECT 1`-equivalent round trip) and reports
/// the live session count from the ConnectionHub. No downstream services to
/// fan out to here — the core owns its database directly.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let db_check = match state.store.ping() {
        Ok(()) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Healthy,
            message: None,
        },
        Err(e) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(e.to_string()),
        },
    };

    let sessions_check = HealthCheck {
        name: "connections".to_string(),
        status: HealthStatus::Healthy,
        message: Some(format!("{} online sessions", state.hub.online_user_count())),
    };

    let response = HealthResponse::healthy("matcher-core", env!("CARGO_PKG_VERSION"))
        .with_checks(vec![db_check, sessions_check]);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Returns Prometheus metrics scraped by the platform's usual collector.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
