//! Idempotent schema bootstrap.
//!
//! Creates every table and index the service depends on with
//! `IF NOT EXISTS`, then records the schema version. Safe to run on every
//! start; concurrent starts converge because each statement is idempotent.

use sqlx::PgPool;
use tracing::info;

pub const SCHEMA_VERSION: &str = "1.0.0";

const STATEMENTS: &[&str] = &[
    // Version tracking.
    r"CREATE TABLE IF NOT EXISTS schema_migrations (
        id SERIAL PRIMARY KEY,
        version VARCHAR(50) NOT NULL UNIQUE,
        description TEXT,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    // Subscriptions.
    r"CREATE TABLE IF NOT EXISTS subscriptions (
        id SERIAL PRIMARY KEY,
        subscriber_id VARCHAR(255) NOT NULL,
        description TEXT NOT NULL,
        pattern VARCHAR(255) NOT NULL,
        channel_type VARCHAR(50),
        channel_config TEXT,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        disposable BOOLEAN NOT NULL DEFAULT FALSE,
        used BOOLEAN NOT NULL DEFAULT FALSE,
        gate JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_subscriber_id ON subscriptions(subscriber_id)",
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_active ON subscriptions(active)",
    "CREATE INDEX IF NOT EXISTS idx_subscriptions_disposable_used ON subscriptions(disposable, used)",
    // Observed (publisher, resource_type, action) triples.
    r"CREATE TABLE IF NOT EXISTS event_schema_registry (
        publisher VARCHAR(255) NOT NULL,
        resource_type VARCHAR(255) NOT NULL,
        action VARCHAR(255) NOT NULL,
        PRIMARY KEY (publisher, resource_type, action)
    )",
    // Append-only canonical event log.
    r"CREATE TABLE IF NOT EXISTS event_logs (
        id SERIAL PRIMARY KEY,
        event_id VARCHAR(255) NOT NULL,
        source VARCHAR(255) NOT NULL,
        subject VARCHAR(255) NOT NULL,
        publisher VARCHAR(255) NOT NULL,
        resource_type VARCHAR(255) NOT NULL,
        resource_id VARCHAR(255) NOT NULL,
        action VARCHAR(255) NOT NULL,
        canonical_data JSONB NOT NULL,
        raw_payload JSONB,
        timestamp TIMESTAMPTZ NOT NULL,
        logged_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_event_logs_event_id ON event_logs(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_event_logs_publisher ON event_logs(publisher)",
    "CREATE INDEX IF NOT EXISTS idx_event_logs_logged_at ON event_logs(logged_at)",
    // Per-subscription delivery log.
    r"CREATE TABLE IF NOT EXISTS subscription_event_logs (
        id SERIAL PRIMARY KEY,
        subscription_id INTEGER NOT NULL,
        event_id VARCHAR(255) NOT NULL,
        source VARCHAR(255) NOT NULL,
        subject VARCHAR(255) NOT NULL,
        publisher VARCHAR(255) NOT NULL,
        resource_type VARCHAR(255) NOT NULL,
        resource_id VARCHAR(255) NOT NULL,
        action VARCHAR(255) NOT NULL,
        canonical_data JSONB NOT NULL,
        raw_payload JSONB,
        timestamp TIMESTAMPTZ NOT NULL,
        webhook_sent BOOLEAN NOT NULL DEFAULT FALSE,
        webhook_response_status INTEGER,
        gate_passed BOOLEAN,
        gate_reason TEXT,
        logged_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_subscription_event_logs_subscription_id ON subscription_event_logs(subscription_id)",
    "CREATE INDEX IF NOT EXISTS idx_subscription_event_logs_logged_at ON subscription_event_logs(logged_at)",
    // Fingerprint → transform cache.
    r"CREATE TABLE IF NOT EXISTS ingest_mappings (
        fingerprint VARCHAR(64) PRIMARY KEY NOT NULL,
        publisher VARCHAR(255) NOT NULL,
        event_name VARCHAR(255) NOT NULL,
        mapping_expr TEXT NOT NULL,
        event_field_expr TEXT,
        structure JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_ingest_mappings_publisher ON ingest_mappings(publisher)",
];

/// Create all tables and indexes, then record the schema version.
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    sqlx::query(
        "INSERT INTO schema_migrations (version, description)
         VALUES ($1, $2) ON CONFLICT (version) DO NOTHING",
    )
    .bind(SCHEMA_VERSION)
    .bind("baseline schema")
    .execute(pool)
    .await?;
    info!(version = SCHEMA_VERSION, "schema bootstrap complete");
    Ok(())
}
