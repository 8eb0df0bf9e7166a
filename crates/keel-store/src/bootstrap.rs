//! Baseline schema for deployments that predate file-based migrations.
//!
//! Runs during adapter initialization.  Skipped whenever the migration
//! runner owns the schema: migration files exist, or the ledger table does.

use std::path::Path;

use serde_json::json;
use tracing::{debug, error, info};

use crate::error::{DbError, DbResult};
use crate::migration::{self, LEDGER_TABLE};
use crate::traits::{AdapterClient, Dialect};

/// Tables created by the baseline, in creation order.
pub const BASELINE_TABLES: &[&str] = &["app_settings", "sync_records", "usage_events", "documents"];

const POSTGRES_BASELINE: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS app_settings (
        key        TEXT PRIMARY KEY,
        value      JSONB NOT NULL DEFAULT '{}'::jsonb,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS sync_records (
        id          BIGSERIAL PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id   TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'pending',
        payload     JSONB,
        synced_at   TIMESTAMPTZ,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS usage_events (
        id          BIGSERIAL PRIMARY KEY,
        event_type  TEXT NOT NULL,
        quantity    BIGINT NOT NULL DEFAULT 1,
        metadata    JSONB,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS documents (
        id         TEXT PRIMARY KEY,
        title      TEXT NOT NULL,
        content    TEXT,
        metadata   JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
];

const SQLITE_BASELINE: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS app_settings (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS sync_records (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        entity_id   TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'pending',
        payload     TEXT,
        synced_at   TEXT,
        created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS usage_events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type  TEXT NOT NULL,
        quantity    INTEGER NOT NULL DEFAULT 1,
        metadata    TEXT,
        occurred_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS documents (
        id         TEXT PRIMARY KEY,
        title      TEXT NOT NULL,
        content    TEXT,
        metadata   TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
];

fn baseline_ddl(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::Postgres => POSTGRES_BASELINE,
        Dialect::Sqlite => SQLITE_BASELINE,
        Dialect::Rest => &[],
    }
}

/// Create the baseline tables when nothing else owns the schema.
///
/// Returns `true` when the baseline was created.  All DDL runs in one
/// transaction; a failing statement rolls everything back and the error is
/// returned.
pub async fn ensure_baseline(
    dialect: Dialect,
    migrations_dir: &Path,
    client: &mut dyn AdapterClient,
) -> DbResult<bool> {
    let ddl = baseline_ddl(dialect);
    if ddl.is_empty() {
        return Ok(false);
    }

    if !migration::discover(migrations_dir).await?.is_empty() {
        debug!(dir = %migrations_dir.display(), "migration files present, skipping baseline schema");
        return Ok(false);
    }
    if table_exists(dialect, client, LEDGER_TABLE).await? {
        debug!("migration ledger present, skipping baseline schema");
        return Ok(false);
    }

    let mut missing = Vec::new();
    for table in BASELINE_TABLES {
        if !table_exists(dialect, client, table).await? {
            missing.push(*table);
        }
    }
    if missing.is_empty() {
        debug!("baseline tables already exist");
        return Ok(false);
    }

    info!(tables = ?missing, "creating baseline schema");
    client
        .query("BEGIN", &[])
        .await
        .map_err(|e| DbError::Transaction(format!("BEGIN failed: {e}")))?;

    for statement in ddl {
        if let Err(e) = client.query(statement, &[]).await {
            error!(error = %e, "baseline schema creation failed, rolling back");
            if let Err(rb) = client.query("ROLLBACK", &[]).await {
                error!(error = %rb, "rollback failed");
            }
            return Err(e);
        }
    }

    client
        .query("COMMIT", &[])
        .await
        .map_err(|e| DbError::Transaction(format!("COMMIT failed: {e}")))?;
    info!("baseline schema created");
    Ok(true)
}

async fn table_exists(
    dialect: Dialect,
    client: &mut dyn AdapterClient,
    table: &str,
) -> DbResult<bool> {
    let result = client
        .query(dialect.table_exists_sql(), &[json!(table)])
        .await?;
    Ok(result.row_count > 0)
}
