//! Connection-failure triage.
//!
//! Classifies a failed connect into a [`FailureCategory`] and attaches
//! actionable suggestions.  Purely diagnostic: nothing here retries.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::DbError;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    HostUnresolvable,
    ConnectionRefused,
    AuthenticationFailed,
    DatabaseMissing,
    Timeout,
    Tls,
    /// The embedded database file could not be opened or created.
    FileAccess,
    Other,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::HostUnresolvable => "host unresolvable",
            Self::ConnectionRefused => "connection refused",
            Self::AuthenticationFailed => "authentication failed",
            Self::DatabaseMissing => "database missing",
            Self::Timeout => "connect timeout",
            Self::Tls => "tls failure",
            Self::FileAccess => "file access",
            Self::Other => "unclassified",
        };
        f.write_str(label)
    }
}

/// What was being connected to; used to make suggestions concrete.
#[derive(Debug, Clone, Default)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u32,
    pub database: String,
    pub user: String,
    pub managed: bool,
}

/// Classify a driver error.
pub fn classify(err: &sqlx::Error) -> FailureCategory {
    match err {
        sqlx::Error::PoolTimedOut => FailureCategory::Timeout,
        sqlx::Error::Tls(_) => FailureCategory::Tls,
        sqlx::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => FailureCategory::ConnectionRefused,
            std::io::ErrorKind::TimedOut => FailureCategory::Timeout,
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                FailureCategory::FileAccess
            }
            _ => classify_message(&io.to_string()),
        },
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("28P01" | "28000") => FailureCategory::AuthenticationFailed,
            Some("3D000") => FailureCategory::DatabaseMissing,
            // SQLITE_CANTOPEN / SQLITE_PERM / SQLITE_READONLY
            Some("14" | "3" | "8") => FailureCategory::FileAccess,
            _ => classify_message(db.message()),
        },
        other => classify_message(&other.to_string()),
    }
}

/// Classify from an error message alone.
pub fn classify_message(message: &str) -> FailureCategory {
    let msg = message.to_ascii_lowercase();
    if msg.contains("failed to lookup address")
        || msg.contains("name or service not known")
        || msg.contains("nodename nor servname")
        || msg.contains("no such host")
        || msg.contains("temporary failure in name resolution")
    {
        FailureCategory::HostUnresolvable
    } else if msg.contains("connection refused") {
        FailureCategory::ConnectionRefused
    } else if msg.contains("password authentication failed")
        || msg.contains("authentication failed")
        || msg.contains("no pg_hba.conf entry")
    {
        FailureCategory::AuthenticationFailed
    } else if msg.contains("database") && msg.contains("does not exist") {
        FailureCategory::DatabaseMissing
    } else if msg.contains("timed out") || msg.contains("timeout") {
        FailureCategory::Timeout
    } else if msg.contains("certificate")
        || msg.contains("self signed")
        || msg.contains("self-signed")
        || msg.contains("tls")
        || msg.contains("ssl")
    {
        FailureCategory::Tls
    } else if msg.contains("unable to open database file") {
        FailureCategory::FileAccess
    } else {
        FailureCategory::Other
    }
}

/// Actionable suggestions for `category`.
pub fn suggestions(category: FailureCategory, target: &ConnectTarget) -> Vec<String> {
    let host = &target.host;
    let port = target.port;
    match category {
        FailureCategory::HostUnresolvable => vec![
            format!("Check that DB_HOST `{host}` is spelled correctly"),
            "Verify DNS resolution from this machine (e.g. `nslookup`)".to_string(),
            "If the database runs in a container, use the service name on the shared network"
                .to_string(),
        ],
        FailureCategory::ConnectionRefused => vec![
            format!("Make sure PostgreSQL is running and listening on {host}:{port}"),
            "Check `listen_addresses` in postgresql.conf and any firewall rules".to_string(),
            "Confirm DB_PORT matches the server port".to_string(),
        ],
        FailureCategory::AuthenticationFailed => vec![
            format!("Verify the password for user `{}`", target.user),
            "Check pg_hba.conf allows this client address and auth method".to_string(),
            "Special characters in DATABASE_URL passwords must be percent-encoded".to_string(),
        ],
        FailureCategory::DatabaseMissing => vec![
            format!("Create the database: `createdb {}`", target.database),
            "Check DB_NAME (or the path component of DATABASE_URL)".to_string(),
        ],
        FailureCategory::Timeout => vec![
            format!("Check network reachability of {host}:{port}"),
            "Increase DB_CONNECT_TIMEOUT_MS if the server is slow to accept connections"
                .to_string(),
            "Lower DB_POOL_MAX if the server is at its connection limit".to_string(),
        ],
        FailureCategory::Tls if target.managed => vec![
            "Managed hosts require TLS; self-signed certificates are accepted automatically"
                .to_string(),
            "Ensure outbound traffic on the database port is not intercepted by a proxy"
                .to_string(),
        ],
        FailureCategory::Tls => vec![
            "Set DB_SSL=false if the server does not support TLS".to_string(),
            "Or add sslmode=require to DATABASE_URL to accept a self-signed certificate"
                .to_string(),
        ],
        FailureCategory::FileAccess => vec![
            format!("Check that `{}` is writable by this process", target.database),
            "Set DATABASE_FILE to a path inside a writable directory".to_string(),
        ],
        FailureCategory::Other => vec![
            "Re-run with RUST_LOG=keel_store=debug for more detail".to_string(),
        ],
    }
}

/// Build a triaged [`DbError::Connection`] from a driver error.
pub fn connection_error(err: &sqlx::Error, target: &ConnectTarget) -> DbError {
    let category = classify(err);
    DbError::Connection {
        category,
        message: err.to_string(),
        suggestions: suggestions(category, target),
    }
}

/// Triaged error for a connect attempt that did not complete within `after`.
pub fn connect_timeout_error(target: &ConnectTarget, after: Duration) -> DbError {
    let category = FailureCategory::Timeout;
    DbError::Connection {
        category,
        message: format!("no connection within {}ms", after.as_millis()),
        suggestions: suggestions(category, target),
    }
}

/// Whether an API error message says `table` does not exist.
pub fn is_missing_table(message: &str, table: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains(table)
        && (msg.contains("does not exist")
            || msg.contains("could not find the table")
            || msg.contains("42p01")
            || msg.contains("pgrst205"))
}
