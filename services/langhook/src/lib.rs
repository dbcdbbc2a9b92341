pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod db;
pub mod http;
pub mod llm;
pub mod map;
pub mod metrics;
pub mod ratelimit;
pub mod state;
pub mod streams;
pub mod subscriptions;

pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health/", get(http::health::health))
        .route("/health", get(http::health::health))
        .route("/ingest/{source}", post(http::ingest::ingest_webhook))
        .route(
            "/subscriptions/",
            post(http::subscriptions_api::create_subscription)
                .get(http::subscriptions_api::list_subscriptions),
        )
        .route(
            "/subscriptions",
            post(http::subscriptions_api::create_subscription)
                .get(http::subscriptions_api::list_subscriptions),
        )
        .route(
            "/subscriptions/event-logs",
            get(http::events_api::list_event_logs),
        )
        .route(
            "/subscriptions/{id}",
            get(http::subscriptions_api::get_subscription)
                .put(http::subscriptions_api::update_subscription)
                .delete(http::subscriptions_api::delete_subscription),
        )
        .route(
            "/subscriptions/{id}/events",
            get(http::events_api::list_subscription_events),
        )
        .route("/schema", get(http::schema_api::schema_summary))
        .route("/map/mappings", get(http::map_api::list_mappings))
        .route(
            "/map/mappings/{fingerprint}",
            axum::routing::delete(http::map_api::delete_mapping),
        )
        .route("/map/metrics", get(http::metrics_api::prometheus_metrics))
        .route("/map/metrics/json", get(http::metrics_api::metrics_json));

    let router = match state.settings.server_path_prefix.as_deref() {
        Some(prefix) => Router::new().nest(prefix, api),
        None => api,
    };
    router.with_state(state)
}
