//! Ingest-mapping administration: inspect the transform cache and evict
//! entries so the next payload of that shape re-synthesises.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{error, info};

use crate::map::store::MappingStore;
use crate::state::AppState;

use super::response;
use super::subscriptions_api::Pagination;

pub async fn list_mappings(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Response {
    let (page, size, limit, offset) = pagination.limits();
    match MappingStore::new(state.pool.clone()).list(limit, offset).await {
        Ok((rows, total)) => Json(serde_json::json!({
            "mappings": rows,
            "total": total,
            "page": page,
            "size": size,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "failed to list ingest mappings");
            response::internal_error("failed to list ingest mappings")
        }
    }
}

pub async fn delete_mapping(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Response {
    match MappingStore::new(state.pool.clone()).delete(&fingerprint).await {
        Ok(true) => {
            info!(fingerprint = %fingerprint, "ingest mapping deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => response::not_found("mapping not found"),
        Err(e) => {
            error!(fingerprint = %fingerprint, error = %e, "failed to delete ingest mapping");
            response::internal_error("failed to delete ingest mapping")
        }
    }
}
