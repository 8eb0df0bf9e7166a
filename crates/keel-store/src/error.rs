//! Error types for the keel-store crate.
//!
//! All adapter, migration and facade operations return [`DbError`] via
//! [`DbResult`].  Configuration and connection failures carry enough context
//! (validation errors, setup guide, triage category, suggestions) to print a
//! complete operator diagnostic with [`DbError::diagnostic`].

use thiserror::Error;

use crate::diagnostics::FailureCategory;

/// Alias for `Result<T, DbError>`.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in the database subsystem.
#[derive(Debug, Error)]
pub enum DbError {
    /// The resolved configuration is unusable.
    #[error("invalid database configuration: {}", errors.join("; "))]
    Config {
        /// Structured validation errors.
        errors: Vec<String>,
        /// Prose setup guide for the detected backend kind.
        guide: String,
    },

    /// Connecting to the backend failed.  Never retried automatically.
    #[error("connection failed ({category}): {message}")]
    Connection {
        category: FailureCategory,
        message: String,
        suggestions: Vec<String>,
    },

    /// A query was rejected by the backend.
    #[error("query failed: {0}")]
    Query(String),

    /// An operation was attempted before `initialize()` succeeded.
    #[error("database is not initialized; call initialize() first")]
    NotInitialized,

    /// The active backend cannot express the requested operation.
    #[error("{backend} backend does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: String,
    },

    /// A migration failed; the run was aborted at this migration.
    #[error("migration {id} ({filename}) failed: {message}")]
    Migration {
        id: u32,
        filename: String,
        message: String,
    },

    /// Migration files could not be discovered or read.
    #[error("migration discovery failed: {0}")]
    Discovery(String),

    /// A connect, acquire or request timeout elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection pool is closed or otherwise unusable.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Beginning, committing or rolling back a transaction failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The restricted-SDK HTTP API returned an error.
    #[error("api error: {0}")]
    Http(String),

    /// An I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// Short machine-readable code for logs and health endpoints.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Config { .. } => "config",
            DbError::Connection { .. } => "connection",
            DbError::Query(_) => "query",
            DbError::NotInitialized => "not_initialized",
            DbError::Unsupported { .. } => "unsupported",
            DbError::Migration { .. } => "migration",
            DbError::Discovery(_) => "discovery",
            DbError::Timeout(_) => "timeout",
            DbError::Pool(_) => "pool",
            DbError::Transaction(_) => "transaction",
            DbError::Http(_) => "http",
            DbError::Io(_) => "io",
            DbError::Json(_) => "json",
        }
    }

    /// The error text without the variant's prefix, for wrapping in a
    /// message that supplies its own context.
    pub fn detail(&self) -> String {
        match self {
            DbError::Query(msg)
            | DbError::Discovery(msg)
            | DbError::Timeout(msg)
            | DbError::Pool(msg)
            | DbError::Transaction(msg)
            | DbError::Http(msg) => msg.clone(),
            DbError::Migration { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Multi-line operator diagnostic.
    ///
    /// Configuration errors list every validation error followed by the
    /// setup guide; connection errors list the triage suggestions.  Other
    /// variants render as their `Display` text.
    pub fn diagnostic(&self) -> String {
        match self {
            DbError::Config { errors, guide } => {
                let mut out = String::from("Database configuration is invalid:\n");
                for err in errors {
                    out.push_str(&format!("  - {err}\n"));
                }
                out.push('\n');
                out.push_str(guide);
                out
            }
            DbError::Connection {
                category,
                message,
                suggestions,
            } => {
                let mut out = format!("Database connection failed ({category}): {message}\n");
                if !suggestions.is_empty() {
                    out.push_str("Suggestions:\n");
                    for s in suggestions {
                        out.push_str(&format!("  - {s}\n"));
                    }
                }
                out
            }
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                DbError::Timeout("timed out acquiring a pooled connection".to_string())
            }
            sqlx::Error::PoolClosed => DbError::Pool("connection pool is closed".to_string()),
            sqlx::Error::Database(db_err) => DbError::Query(db_err.to_string()),
            other => DbError::Query(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DbError::Timeout(err.to_string())
        } else {
            DbError::Http(err.to_string())
        }
    }
}
