//! Subscription CRUD.
//!
//! Create and update compile the natural-language description into a
//! subject pattern (422 when no schema fits) and reflect the change into
//! the running consumer set before responding.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, info};

use crate::state::AppState;
use crate::subscriptions::nlp::CompileError;
use crate::subscriptions::repo::{self, DEFAULT_SUBSCRIBER};

use super::response;

#[derive(Debug, Deserialize)]
pub struct GateSpec {
    pub enabled: bool,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub failover_policy: Option<String>,
}

impl GateSpec {
    /// Materialise the gate column JSON, filling the prompt from the
    /// compiler when the caller did not provide one.
    fn to_column(&self, compiled_prompt: Option<&str>) -> serde_json::Value {
        let mut gate = serde_json::json!({ "enabled": self.enabled });
        let prompt = self.prompt.as_deref().or(compiled_prompt);
        if let Some(prompt) = prompt {
            gate["prompt"] = serde_json::Value::String(prompt.to_owned());
        }
        if let Some(model) = &self.model {
            gate["model"] = serde_json::Value::String(model.clone());
        }
        if let Some(policy) = &self.failover_policy {
            gate["failover_policy"] = serde_json::Value::String(policy.clone());
        }
        gate
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionCreate {
    pub description: String,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub channel_config: Option<serde_json::Value>,
    #[serde(default)]
    pub gate: Option<GateSpec>,
    #[serde(default)]
    pub disposable: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub channel_config: Option<serde_json::Value>,
    #[serde(default)]
    pub gate: Option<GateSpec>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub disposable: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub size: Option<i64>,
}

impl Pagination {
    pub fn limits(&self) -> (i64, i64, i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let size = self.size.unwrap_or(50).clamp(1, 100);
        (page, size, size, (page - 1) * size)
    }
}

fn no_schema_response(description: &str) -> Response {
    response::unprocessable(format!(
        "No suitable event schema found for description: '{description}'. \
         Check available schemas at /schema."
    ))
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionCreate>,
) -> Response {
    let gate_enabled = body.gate.as_ref().is_some_and(|g| g.enabled);
    let compiled = match state.compiler.compile(&body.description, gate_enabled).await {
        Ok(compiled) => compiled,
        Err(CompileError::NoSuitableSchema(_)) => {
            return no_schema_response(&body.description);
        }
    };

    let gate_column = body
        .gate
        .as_ref()
        .map(|g| g.to_column(compiled.gate_prompt.as_deref()));

    let row = match repo::create_subscription(
        &state.pool,
        DEFAULT_SUBSCRIBER,
        &body.description,
        &compiled.pattern,
        body.channel_type.as_deref(),
        body.channel_config.as_ref(),
        gate_column.as_ref(),
        body.disposable,
    )
    .await
    {
        Ok(row) => row,
        Err(e) => {
            error!(error = %e, "failed to create subscription");
            return response::internal_error("failed to create subscription");
        }
    };

    // The consumer must exist before the client hears 201.
    state.supervisor.add(row.clone()).await;
    info!(
        subscription_id = row.id,
        pattern = %row.pattern,
        "subscription created"
    );
    (StatusCode::CREATED, Json(row)).into_response()
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
) -> Response {
    let (page, size, limit, offset) = pagination.limits();
    match repo::list_subscriptions(&state.pool, DEFAULT_SUBSCRIBER, limit, offset).await {
        Ok((rows, total)) => Json(serde_json::json!({
            "subscriptions": rows,
            "total": total,
            "page": page,
            "size": size,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "failed to list subscriptions");
            response::internal_error("failed to list subscriptions")
        }
    }
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Response {
    match repo::get_subscription(&state.pool, id, DEFAULT_SUBSCRIBER).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => response::not_found("subscription not found"),
        Err(e) => response::internal_error(e),
    }
}

pub async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(body): Json<SubscriptionUpdate>,
) -> Response {
    let existing = match repo::get_subscription(&state.pool, id, DEFAULT_SUBSCRIBER).await {
        Ok(Some(row)) => row,
        Ok(None) => return response::not_found("subscription not found"),
        Err(e) => return response::internal_error(e),
    };

    let description = body.description.clone().unwrap_or_else(|| existing.description.clone());
    let gate_enabled = body
        .gate
        .as_ref()
        .map_or(existing.gate_enabled(), |g| g.enabled);

    // A description change recompiles the pattern; a newly supplied gate
    // needs a prompt even when the description is unchanged.
    let needs_compile = body.description.is_some()
        || body.gate.as_ref().is_some_and(|g| g.enabled && g.prompt.is_none());
    let compiled = if needs_compile {
        match state.compiler.compile(&description, gate_enabled).await {
            Ok(compiled) => Some(compiled),
            Err(CompileError::NoSuitableSchema(_)) => {
                return no_schema_response(&description);
            }
        }
    } else {
        None
    };

    let pattern = match (&body.description, &compiled) {
        (Some(_), Some(compiled)) => compiled.pattern.clone(),
        _ => existing.pattern.clone(),
    };
    let gate_column = match &body.gate {
        Some(gate) => Some(gate.to_column(
            compiled.as_ref().and_then(|c| c.gate_prompt.as_deref()),
        )),
        None => existing.gate.clone(),
    };
    let channel_type = body.channel_type.clone().or_else(|| existing.channel_type.clone());
    let channel_config = body
        .channel_config
        .as_ref()
        .map(serde_json::Value::to_string)
        .or_else(|| existing.channel_config.clone());

    let updated = match repo::update_subscription(
        &state.pool,
        id,
        DEFAULT_SUBSCRIBER,
        &description,
        &pattern,
        channel_type.as_deref(),
        channel_config.as_deref(),
        gate_column.as_ref(),
        body.active.unwrap_or(existing.active),
        body.disposable.unwrap_or(existing.disposable),
    )
    .await
    {
        Ok(Some(row)) => row,
        Ok(None) => return response::not_found("subscription not found"),
        Err(e) => {
            error!(subscription_id = id, error = %e, "failed to update subscription");
            return response::internal_error("failed to update subscription");
        }
    };

    // Filter or gate may have changed: replace the running consumer.
    state.supervisor.update(updated.clone()).await;
    info!(subscription_id = id, "subscription updated");
    Json(updated).into_response()
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Response {
    match repo::delete_subscription(&state.pool, id, DEFAULT_SUBSCRIBER).await {
        Ok(true) => {
            state.supervisor.remove(id).await;
            info!(subscription_id = id, "subscription deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => response::not_found("subscription not found"),
        Err(e) => {
            error!(subscription_id = id, error = %e, "failed to delete subscription");
            response::internal_error("failed to delete subscription")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_clamps() {
        let (page, size, limit, offset) = Pagination { page: None, size: None }.limits();
        assert_eq!((page, size, limit, offset), (1, 50, 50, 0));

        let (page, size, limit, offset) = Pagination {
            page: Some(3),
            size: Some(500),
        }
        .limits();
        assert_eq!((page, size, limit, offset), (3, 100, 100, 200));

        let (page, ..) = Pagination {
            page: Some(-1),
            size: Some(0),
        }
        .limits();
        assert_eq!(page, 1);
    }

    #[test]
    fn gate_spec_prefers_the_callers_prompt() {
        let spec = GateSpec {
            enabled: true,
            prompt: Some("mine".to_owned()),
            model: None,
            failover_policy: Some("fail_closed".to_owned()),
        };
        let column = spec.to_column(Some("compiled"));
        assert_eq!(column["prompt"], "mine");
        assert_eq!(column["failover_policy"], "fail_closed");

        let spec = GateSpec {
            enabled: true,
            prompt: None,
            model: None,
            failover_policy: None,
        };
        let column = spec.to_column(Some("compiled"));
        assert_eq!(column["prompt"], "compiled");
        assert_eq!(column["enabled"], true);
    }
}
