//! Event-log query surfaces.

use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::state::AppState;
use crate::subscriptions::repo::{self, DEFAULT_SUBSCRIBER};

use super::response;
use super::subscriptions_api::Pagination;

/// `GET /subscriptions/event-logs` — the global canonical event log.
pub async fn list_event_logs(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Response {
    let (page, size, limit, offset) = pagination.limits();
    match repo::list_event_logs(&state.pool, limit, offset).await {
        Ok((rows, total)) => Json(serde_json::json!({
            "event_logs": rows,
            "total": total,
            "page": page,
            "size": size,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "failed to list event logs");
            response::internal_error("failed to list event logs")
        }
    }
}

/// `GET /subscriptions/{id}/events` — one subscription's delivery log.
pub async fn list_subscription_events(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(pagination): Query<Pagination>,
) -> Response {
    match repo::get_subscription(&state.pool, id, DEFAULT_SUBSCRIBER).await {
        Ok(Some(_)) => {}
        Ok(None) => return response::not_found("subscription not found"),
        Err(e) => return response::internal_error(e),
    }

    let (page, size, limit, offset) = pagination.limits();
    match repo::list_subscription_event_logs(&state.pool, id, limit, offset).await {
        Ok((rows, total)) => Json(serde_json::json!({
            "event_logs": rows,
            "total": total,
            "page": page,
            "size": size,
        }))
        .into_response(),
        Err(e) => {
            error!(subscription_id = id, error = %e, "failed to list subscription events");
            response::internal_error("failed to list subscription events")
        }
    }
}
