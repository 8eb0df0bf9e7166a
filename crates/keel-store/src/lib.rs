//! # keel-store
//!
//! Database access and schema migrations for Keel.
//!
//! One [`Database`] facade fronts exactly one backend adapter, chosen from
//! the resolved [`DatabaseConfig`]:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Database (facade: lifecycle, query, health)         │
//! ├──────────────────────────────────────────────────────┤
//! │  DatabaseAdapter                                     │
//! │    PostgresAdapter       (sqlx PgPool)               │
//! │    SqliteAdapter         (sqlx SqlitePool, file)     │
//! │    RestrictedSdkAdapter  (REST API, no raw SQL)      │
//! ├──────────────────────────────────────────────────────┤
//! │  MigrationRunner (NNN_name.sql, ledger, checksums)   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use keel_store::{ConfigResolver, Database};
//!
//! let config = ConfigResolver::from_env().resolve()?;
//! let db = Database::new(config);
//! db.initialize().await?;
//! let rows = db.query("SELECT key, value FROM app_settings", &[]).await?;
//! ```

pub mod bootstrap;
pub mod config;
pub mod database;
pub mod diagnostics;
pub mod embedded;
pub mod error;
pub mod migration;
pub mod relational;
pub mod restricted;
mod sql;
pub mod traits;

// ── re-exports ───────────────────────────────────────────────────────

pub use config::{
    BackendConfig, BackendKind, ConfigResolver, ConfigSummary, DatabaseConfig,
    EmbeddedFileConfig, RelationalConfig, RestrictedSdkConfig, ValidationReport,
};
pub use database::Database;
pub use diagnostics::FailureCategory;
pub use embedded::SqliteAdapter;
pub use error::{DbError, DbResult};
pub use migration::{
    MigrationFile, MigrationRecord, MigrationReport, MigrationRunner, MigrationState,
    MigrationStatus, ValidationFindings,
};
pub use relational::PostgresAdapter;
pub use restricted::{RestClient, RestrictedSdkAdapter};
pub use traits::{
    AdapterClient, DatabaseAdapter, Dialect, HealthReport, HealthStatus, QueryResult, Row,
};
