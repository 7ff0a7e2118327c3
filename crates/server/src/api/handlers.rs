use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use harvester_core::{SanitizedConfig, SessionStatus};

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub processors: usize,
    pub broker: String,
    pub started_at: DateTime<Utc>,
}

/// Ready only while the broker session is connected.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let broker = state.broker_status();
    let (code, status) = match broker {
        SessionStatus::Connected => (StatusCode::OK, "ok"),
        SessionStatus::Recovering | SessionStatus::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            processors: state.registry().len(),
            broker: broker.as_str().to_string(),
            started_at: state.started_at(),
        }),
    )
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<SanitizedConfig> {
    Json(state.sanitized_config())
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
