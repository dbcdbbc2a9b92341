//! Schema registry summary, as consumed by subscription authors.

use axum::{Json, extract::State, response::IntoResponse, response::Response};

use crate::state::AppState;
use crate::subscriptions::repo;

pub async fn schema_summary(State(state): State<AppState>) -> Response {
    Json(repo::schema_summary(&state.pool).await).into_response()
}
