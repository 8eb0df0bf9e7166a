//! Core adapter trait and supporting types.
//!
//! Every backend (pooled PostgreSQL, embedded SQLite, restricted REST API)
//! implements [`DatabaseAdapter`], giving the facade and the migration runner
//! one uniform interface for connecting, querying, checking out clients and
//! migrating.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BackendKind;
use crate::error::DbResult;
use crate::migration::{MigrationReport, MigrationRunner, MigrationStatus, ValidationFindings};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// One result row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Result of a single statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Rows returned, or rows affected for statements without a result set.
    pub row_count: u64,
    /// Column names in result order; empty when unknown.
    pub fields: Vec<String>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>, fields: Vec<String>) -> Self {
        Self {
            row_count: rows.len() as u64,
            rows,
            fields,
        }
    }

    pub fn affected(row_count: u64) -> Self {
        Self {
            rows: Vec::new(),
            row_count,
            fields: Vec::new(),
        }
    }

    /// Value of `column` in the first row.
    pub fn first_value(&self, column: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(column))
    }
}

/// SQL flavour spoken by an adapter.  Covers exactly what the migration
/// runner and the bootstrap path need to stay backend-neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Sqlite,
    /// Structured REST calls; statements are parsed, never executed as SQL.
    Rest,
}

impl Dialect {
    /// Positional placeholder for the 1-based `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Postgres | Self::Rest => format!("${index}"),
            Self::Sqlite => format!("?{index}"),
        }
    }

    /// Whether DDL participates in transactions (rolls back cleanly).
    pub fn transactional_ddl(&self) -> bool {
        matches!(self, Self::Postgres | Self::Sqlite)
    }

    /// Whether arbitrary SQL, DDL included, can be executed at all.
    pub fn executes_sql(&self) -> bool {
        !matches!(self, Self::Rest)
    }

    /// DDL for the migrations ledger.
    pub fn ledger_ddl(&self) -> &'static str {
        match self {
            Self::Postgres => {
                "CREATE TABLE IF NOT EXISTS migrations (
                    id          BIGINT PRIMARY KEY,
                    filename    TEXT NOT NULL,
                    executed_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    checksum    TEXT NOT NULL
                )"
            }
            Self::Sqlite | Self::Rest => {
                "CREATE TABLE IF NOT EXISTS migrations (
                    id          INTEGER PRIMARY KEY,
                    filename    TEXT NOT NULL,
                    executed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    checksum    TEXT NOT NULL
                )"
            }
        }
    }

    /// Query returning one row when the table named by the single parameter
    /// exists.
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Self::Postgres | Self::Rest => {
                "SELECT 1 AS present FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Self::Sqlite => "SELECT 1 AS present FROM sqlite_master WHERE type = 'table' AND name = ?1",
        }
    }
}

/// The health status of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The adapter is fully operational.
    Healthy,
    /// The adapter is working but with reduced capability or elevated latency.
    Degraded,
    /// The adapter is not functional.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of a health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend: BackendKind,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Probe latency above which a healthy round trip is reported as degraded.
const DEGRADED_LATENCY_MS: u64 = 1_000;

impl HealthReport {
    pub(crate) fn from_probe(backend: BackendKind, started: Instant, outcome: DbResult<()>) -> Self {
        let latency_ms = started.elapsed().as_millis() as u64;
        let (status, message) = match outcome {
            Ok(()) if latency_ms > DEGRADED_LATENCY_MS => (
                HealthStatus::Degraded,
                Some(format!("probe took {latency_ms}ms")),
            ),
            Ok(()) => (HealthStatus::Healthy, None),
            Err(err) => (HealthStatus::Unhealthy, Some(err.to_string())),
        };
        Self {
            status,
            backend,
            latency_ms,
            message,
            checked_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// A checked-out connection bound to one logical unit of work.
///
/// The connection is exclusively owned until [`AdapterClient::release`].
/// Releasing twice is a no-op, and dropping an unreleased client releases it.
#[async_trait]
pub trait AdapterClient: Send {
    /// Run one statement on this client's connection.
    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<QueryResult>;

    /// Return the connection to the pool.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Core trait
// ---------------------------------------------------------------------------

/// The backend capability interface.
///
/// Data operations fail with [`crate::DbError::NotInitialized`] until
/// [`DatabaseAdapter::initialize`] succeeds.  A second `initialize` while
/// initialized is a no-op; `close` is idempotent.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn dialect(&self) -> Dialect;

    fn is_initialized(&self) -> bool;

    /// Directory the bound migration runner reads from.
    fn migrations_dir(&self) -> &Path;

    /// Connect and verify the backend.  Leaves the adapter either usable or
    /// fully torn down.
    async fn initialize(&self) -> DbResult<()>;

    /// Run one statement on an automatically managed connection.
    async fn query(&self, sql: &str, params: &[Value]) -> DbResult<QueryResult>;

    /// Check out an independent client.
    async fn get_client(&self) -> DbResult<Box<dyn AdapterClient>>;

    /// Release all pooled resources.
    async fn close(&self) -> DbResult<()>;

    /// Apply pending migrations through the runner bound to this adapter.
    async fn run_migrations(&self) -> DbResult<MigrationReport> {
        MigrationRunner::new(self, self.migrations_dir()).run().await
    }

    async fn migration_status(&self) -> DbResult<MigrationStatus> {
        MigrationRunner::new(self, self.migrations_dir()).status().await
    }

    /// Drift and gap findings; never mutates anything.
    async fn validate_migrations(&self) -> DbResult<ValidationFindings> {
        MigrationRunner::new(self, self.migrations_dir()).validate().await
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let outcome = self.query("SELECT 1", &[]).await.map(|_| ());
        HealthReport::from_probe(self.kind(), started, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_follow_dialect() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert!(!Dialect::Rest.transactional_ddl());
    }

    #[test]
    fn query_result_helpers() {
        let mut row = Row::new();
        row.insert("n".into(), Value::from(3));
        let result = QueryResult::from_rows(vec![row], vec!["n".into()]);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.first_value("n"), Some(&Value::from(3)));
        assert_eq!(QueryResult::affected(4).row_count, 4);
    }

    #[test]
    fn slow_probe_is_degraded() {
        let started = Instant::now() - std::time::Duration::from_millis(1_500);
        let report = HealthReport::from_probe(BackendKind::EmbeddedFile, started, Ok(()));
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}
