//! Metrics endpoints: Prometheus text and a JSON roll-up.

use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
        .into_response()
}

pub async fn metrics_json(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}
