//! Persistence for subscriptions, event logs, and the schema registry.
//!
//! Plain runtime-checked queries against the pool; every function takes the
//! pool explicitly so callers stay testable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lh_protocol::Envelope;
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;

/// The placeholder subscriber identity — auth is out of scope.
pub const DEFAULT_SUBSCRIBER: &str = "default";

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: i32,
    pub subscriber_id: String,
    pub description: String,
    pub pattern: String,
    pub channel_type: Option<String>,
    /// JSON text: `{"url": ..., "method"?: ..., "headers"?: {...}}`.
    pub channel_config: Option<String>,
    pub active: bool,
    pub disposable: bool,
    pub used: bool,
    /// JSON: `{"enabled": bool, "prompt"?: ..., "model"?: ...,
    /// "failover_policy"?: "fail_open"|"fail_closed"}`.
    pub gate: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubscriptionRow {
    /// A subscription takes part in routing unless it is inactive or a
    /// spent one-shot.
    pub fn is_routable(&self) -> bool {
        self.active && !(self.disposable && self.used)
    }

    pub fn gate_enabled(&self) -> bool {
        self.gate
            .as_ref()
            .and_then(|g| g.get("enabled"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, subscriber_id, description, pattern, channel_type, \
     channel_config, active, disposable, used, gate, created_at, updated_at";

#[allow(clippy::too_many_arguments)]
pub async fn create_subscription(
    pool: &PgPool,
    subscriber_id: &str,
    description: &str,
    pattern: &str,
    channel_type: Option<&str>,
    channel_config: Option<&serde_json::Value>,
    gate: Option<&serde_json::Value>,
    disposable: bool,
) -> Result<SubscriptionRow, sqlx::Error> {
    let sql = format!(
        "INSERT INTO subscriptions
            (subscriber_id, description, pattern, channel_type, channel_config, gate, disposable)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING {SUBSCRIPTION_COLUMNS}"
    );
    sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(subscriber_id)
        .bind(description)
        .bind(pattern)
        .bind(channel_type)
        .bind(channel_config.map(serde_json::Value::to_string))
        .bind(gate)
        .bind(disposable)
        .fetch_one(pool)
        .await
}

pub async fn get_subscription(
    pool: &PgPool,
    id: i32,
    subscriber_id: &str,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 AND subscriber_id = $2"
    );
    sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(id)
        .bind(subscriber_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_subscriptions(
    pool: &PgPool,
    subscriber_id: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<SubscriptionRow>, i64), sqlx::Error> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
         WHERE subscriber_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
    );
    let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(subscriber_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE subscriber_id = $1")
            .bind(subscriber_id)
            .fetch_one(pool)
            .await?;
    Ok((rows, total))
}

/// Full-row update (the handler merges changes first). Bumps `updated_at`.
#[allow(clippy::too_many_arguments)]
pub async fn update_subscription(
    pool: &PgPool,
    id: i32,
    subscriber_id: &str,
    description: &str,
    pattern: &str,
    channel_type: Option<&str>,
    channel_config: Option<&str>,
    gate: Option<&serde_json::Value>,
    active: bool,
    disposable: bool,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    let sql = format!(
        "UPDATE subscriptions
         SET description = $3, pattern = $4, channel_type = $5, channel_config = $6,
             gate = $7, active = $8, disposable = $9, updated_at = NOW()
         WHERE id = $1 AND subscriber_id = $2
         RETURNING {SUBSCRIPTION_COLUMNS}"
    );
    sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(id)
        .bind(subscriber_id)
        .bind(description)
        .bind(pattern)
        .bind(channel_type)
        .bind(channel_config)
        .bind(gate)
        .bind(active)
        .bind(disposable)
        .fetch_optional(pool)
        .await
}

pub async fn delete_subscription(
    pool: &PgPool,
    id: i32,
    subscriber_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1 AND subscriber_id = $2")
        .bind(id)
        .bind(subscriber_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Retire a one-shot subscription after its first successful delivery.
pub async fn mark_used(pool: &PgPool, id: i32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE subscriptions SET used = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Every subscription that should have a running consumer.
pub async fn list_active_routable(pool: &PgPool) -> Result<Vec<SubscriptionRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
         WHERE active = TRUE AND NOT (disposable = TRUE AND used = TRUE)
         ORDER BY id"
    );
    sqlx::query_as::<_, SubscriptionRow>(&sql).fetch_all(pool).await
}

// ---------------------------------------------------------------------------
// Event logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EventLogRow {
    pub id: i32,
    pub event_id: String,
    pub source: String,
    pub subject: String,
    pub publisher: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub canonical_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

fn event_timestamp(envelope: &Envelope) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&envelope.data.timestamp)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Append one canonical event to the global event log.
pub async fn append_event_log(pool: &PgPool, envelope: &Envelope) -> Result<(), sqlx::Error> {
    let event = &envelope.data;
    sqlx::query(
        "INSERT INTO event_logs
            (event_id, source, subject, publisher, resource_type, resource_id, action,
             canonical_data, raw_payload, timestamp)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(&envelope.id)
    .bind(&event.publisher)
    .bind(&envelope.subject)
    .bind(&event.publisher)
    .bind(&event.resource.kind)
    .bind(event.resource.id.to_string())
    .bind(event.action.as_str())
    .bind(serde_json::to_value(event).unwrap_or(serde_json::Value::Null))
    .bind(&event.payload)
    .bind(event_timestamp(envelope))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_event_logs(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<EventLogRow>, i64), sqlx::Error> {
    let rows = sqlx::query_as::<_, EventLogRow>(
        "SELECT id, event_id, source, subject, publisher, resource_type, resource_id, action,
                canonical_data, timestamp, logged_at
         FROM event_logs ORDER BY logged_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_logs")
        .fetch_one(pool)
        .await?;
    Ok((rows, total))
}

// ---------------------------------------------------------------------------
// Subscription event logs
// ---------------------------------------------------------------------------

/// Everything recorded about one (subscription, event) encounter.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub subscription_id: i32,
    pub webhook_sent: bool,
    pub webhook_response_status: Option<i32>,
    pub gate_passed: Option<bool>,
    pub gate_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionEventLogRow {
    pub id: i32,
    pub subscription_id: i32,
    pub event_id: String,
    pub subject: String,
    pub publisher: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub canonical_data: serde_json::Value,
    pub webhook_sent: bool,
    pub webhook_response_status: Option<i32>,
    pub gate_passed: Option<bool>,
    pub gate_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

pub async fn append_subscription_event_log(
    pool: &PgPool,
    envelope: &Envelope,
    record: &DeliveryRecord,
) -> Result<(), sqlx::Error> {
    let event = &envelope.data;
    sqlx::query(
        "INSERT INTO subscription_event_logs
            (subscription_id, event_id, source, subject, publisher, resource_type, resource_id,
             action, canonical_data, raw_payload, timestamp, webhook_sent,
             webhook_response_status, gate_passed, gate_reason)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(record.subscription_id)
    .bind(&envelope.id)
    .bind(&event.publisher)
    .bind(&envelope.subject)
    .bind(&event.publisher)
    .bind(&event.resource.kind)
    .bind(event.resource.id.to_string())
    .bind(event.action.as_str())
    .bind(serde_json::to_value(event).unwrap_or(serde_json::Value::Null))
    .bind(&event.payload)
    .bind(event_timestamp(envelope))
    .bind(record.webhook_sent)
    .bind(record.webhook_response_status)
    .bind(record.gate_passed)
    .bind(record.gate_reason.as_deref())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_subscription_event_logs(
    pool: &PgPool,
    subscription_id: i32,
    limit: i64,
    offset: i64,
) -> Result<(Vec<SubscriptionEventLogRow>, i64), sqlx::Error> {
    let rows = sqlx::query_as::<_, SubscriptionEventLogRow>(
        "SELECT id, subscription_id, event_id, subject, publisher, resource_type, resource_id,
                action, canonical_data, webhook_sent, webhook_response_status, gate_passed,
                gate_reason, timestamp, logged_at
         FROM subscription_event_logs
         WHERE subscription_id = $1 ORDER BY logged_at DESC LIMIT $2 OFFSET $3",
    )
    .bind(subscription_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM subscription_event_logs WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(pool)
            .await?;
    Ok((rows, total))
}

// ---------------------------------------------------------------------------
// Schema registry
// ---------------------------------------------------------------------------

/// Observed event shapes, fed to the pattern compiler as a closed vocabulary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaSummary {
    pub publishers: Vec<String>,
    pub resource_types: BTreeMap<String, Vec<String>>,
    pub actions: Vec<String>,
}

impl SchemaSummary {
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

/// Record an observed (publisher, resource_type, action) triple.
///
/// Registry failures never break canonicalisation: errors are logged and
/// swallowed, and concurrent inserts converge via conflict-do-nothing.
pub async fn register_event_schema(
    pool: &PgPool,
    publisher: &str,
    resource_type: &str,
    action: &str,
) {
    let result = sqlx::query(
        "INSERT INTO event_schema_registry (publisher, resource_type, action)
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
    )
    .bind(publisher)
    .bind(resource_type)
    .bind(action)
    .execute(pool)
    .await;
    if let Err(e) = result {
        warn!(publisher, resource_type, action, error = %e, "failed to register event schema");
    }
}

/// Aggregate the registry. Failures yield an empty summary with a warning;
/// callers never see an error.
pub async fn schema_summary(pool: &PgPool) -> SchemaSummary {
    let rows: Vec<(String, String, String)> = match sqlx::query_as(
        "SELECT publisher, resource_type, action FROM event_schema_registry
         ORDER BY publisher, resource_type, action",
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "failed to read schema registry");
            return SchemaSummary::default();
        }
    };

    let mut summary = SchemaSummary::default();
    for (publisher, resource_type, action) in rows {
        if !summary.publishers.contains(&publisher) {
            summary.publishers.push(publisher.clone());
        }
        let types = summary.resource_types.entry(publisher).or_default();
        if !types.contains(&resource_type) {
            types.push(resource_type);
        }
        if !summary.actions.contains(&action) {
            summary.actions.push(action);
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(active: bool, disposable: bool, used: bool) -> SubscriptionRow {
        SubscriptionRow {
            id: 1,
            subscriber_id: DEFAULT_SUBSCRIBER.to_owned(),
            description: "d".to_owned(),
            pattern: "langhook.events.>".to_owned(),
            channel_type: None,
            channel_config: None,
            active,
            disposable,
            used,
            gate: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn used_disposables_are_not_routable() {
        assert!(row(true, false, false).is_routable());
        assert!(row(true, true, false).is_routable());
        assert!(!row(true, true, true).is_routable());
        assert!(!row(false, false, false).is_routable());
        // `used` without `disposable` keeps routing.
        assert!(row(true, false, true).is_routable());
    }

    #[test]
    fn gate_enabled_reads_the_json_flag() {
        let mut sub = row(true, false, false);
        assert!(!sub.gate_enabled());
        sub.gate = Some(serde_json::json!({"enabled": true, "prompt": "p"}));
        assert!(sub.gate_enabled());
        sub.gate = Some(serde_json::json!({"enabled": false}));
        assert!(!sub.gate_enabled());
    }
}
