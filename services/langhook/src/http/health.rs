//! Liveness with a component roll-up.

use axum::{Json, extract::State, response::IntoResponse, response::Response};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let database = match sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
    {
        Ok(_) => "up",
        Err(_) => "down",
    };
    let llm = if state.chat.is_available() {
        "up"
    } else {
        "unconfigured"
    };
    Json(serde_json::json!({
        "status": "up",
        "components": {
            "database": database,
            "llm": llm,
        },
    }))
    .into_response()
}
