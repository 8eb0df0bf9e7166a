//! Backend configuration.
//!
//! A [`DatabaseConfig`] is resolved once from the environment by
//! [`ConfigResolver`], checked with [`validate`], and then passed by value
//! into [`crate::Database::new`].  Nothing here is cached globally; resolving
//! again simply produces a fresh value.

mod resolve;
mod validation;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::DbError;

pub use resolve::ConfigResolver;
pub use validation::{ValidationReport, describe_setup, validate};

// ── defaults ─────────────────────────────────────────────────────────

/// Default maximum number of pooled connections.
pub const DEFAULT_POOL_MAX: u32 = 10;
/// Upper bound accepted for `DB_POOL_MAX`.
pub const MAX_POOL_SIZE: u32 = 100;
/// Default idle timeout for pooled connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Default connect / acquire timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Default request timeout for the restricted-SDK HTTP client.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default PostgreSQL port.
pub const DEFAULT_PG_PORT: u32 = 5432;
/// Default embedded database file.
pub const DEFAULT_DATABASE_FILE: &str = "data/keel.db";
/// Default migrations directory.
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Host suffixes of managed PostgreSQL providers.  Connections to these
/// always use TLS and always need a password.
const MANAGED_HOST_SUFFIXES: &[&str] = &[
    ".supabase.co",
    ".supabase.com",
    ".neon.tech",
    ".rds.amazonaws.com",
    ".render.com",
    ".railway.app",
    ".postgres.database.azure.com",
    ".ondigitalocean.com",
    ".aivencloud.com",
];

// ── types ────────────────────────────────────────────────────────────

/// Which physical backend the adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Pooled PostgreSQL reachable through direct SQL.
    Relational,
    /// Hosted REST API without arbitrary SQL.
    RestrictedSdk,
    /// Local SQLite file.
    EmbeddedFile,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::RestrictedSdk => "restricted-sdk",
            Self::EmbeddedFile => "embedded-file",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" | "pg" => Ok(Self::Relational),
            "restricted-sdk" | "restricted_sdk" | "sdk" | "supabase" | "rest" => {
                Ok(Self::RestrictedSdk)
            }
            "embedded-file" | "embedded_file" | "embedded" | "sqlite" | "file" => {
                Ok(Self::EmbeddedFile)
            }
            other => Err(DbError::Config {
                errors: vec![format!(
                    "DATABASE_BACKEND `{other}` is not one of relational, restricted-sdk, embedded-file"
                )],
                guide: validation::generic_guide(),
            }),
        }
    }
}

/// Connection parameters for the pooled PostgreSQL backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalConfig {
    pub host: String,
    /// Kept wider than `u16` so validation can report out-of-range values.
    pub port: u32,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub ssl: bool,
    /// TLS was explicitly disabled by the caller but forced on because the
    /// host is a managed provider.
    pub ssl_overridden: bool,
    pub pool_max: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Fields were parsed from `DATABASE_URL` rather than discrete variables.
    pub from_url: bool,
    /// Extra connection-string query parameters.
    pub options: BTreeMap<String, String>,
}

/// Connection parameters for the restricted REST backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedSdkConfig {
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Location and pool sizing of the embedded SQLite file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedFileConfig {
    pub path: PathBuf,
    pub pool_max: u32,
    pub connect_timeout: Duration,
}

/// Exactly one backend variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Relational(RelationalConfig),
    RestrictedSdk(RestrictedSdkConfig),
    EmbeddedFile(EmbeddedFileConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Relational(_) => BackendKind::Relational,
            Self::RestrictedSdk(_) => BackendKind::RestrictedSdk,
            Self::EmbeddedFile(_) => BackendKind::EmbeddedFile,
        }
    }
}

/// The complete, immutable database configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub backend: BackendConfig,
    /// Value of `APP_ENV`, if declared.
    pub environment: Option<String>,
    pub migrations_dir: PathBuf,
    /// Run pending migrations during `Database::initialize`.
    pub auto_migrate: bool,
}

impl DatabaseConfig {
    /// Configuration for an embedded SQLite file with default pool settings.
    pub fn embedded(path: impl Into<PathBuf>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::EmbeddedFile(EmbeddedFileConfig {
                path: path.into(),
                pool_max: DEFAULT_POOL_MAX,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            }),
            environment: Some("development".to_string()),
            migrations_dir: migrations_dir.into(),
            auto_migrate: true,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_production(&self) -> bool {
        is_production(self.environment.as_deref())
    }

    /// Redacted view of the configuration.  Never contains credentials.
    pub fn summary(&self) -> ConfigSummary {
        let mut summary = ConfigSummary {
            backend: self.kind(),
            environment: self.environment.clone(),
            migrations_dir: self.migrations_dir.display().to_string(),
            auto_migrate: self.auto_migrate,
            host: None,
            port: None,
            database: None,
            user: None,
            ssl: None,
            pool_max: None,
            has_password: false,
            api_url: None,
            has_api_key: false,
            file_path: None,
        };
        match &self.backend {
            BackendConfig::Relational(rel) => {
                summary.host = Some(rel.host.clone());
                summary.port = Some(rel.port);
                summary.database = Some(rel.database.clone());
                summary.user = Some(rel.user.clone());
                summary.ssl = Some(rel.ssl);
                summary.pool_max = Some(rel.pool_max);
                summary.has_password = rel.password.as_deref().is_some_and(|p| !p.is_empty());
            }
            BackendConfig::RestrictedSdk(sdk) => {
                summary.api_url = Some(sdk.url.clone());
                summary.has_api_key = !sdk.api_key.is_empty();
            }
            BackendConfig::EmbeddedFile(file) => {
                summary.file_path = Some(file.path.display().to_string());
                summary.pool_max = Some(file.pool_max);
            }
        }
        summary
    }
}

/// Credential-free configuration summary for health and debugging output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    pub backend: BackendKind,
    pub environment: Option<String>,
    pub migrations_dir: String,
    pub auto_migrate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_max: Option<u32>,
    pub has_password: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub has_api_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

// ── host classification ──────────────────────────────────────────────

/// Whether `host` belongs to a managed PostgreSQL provider.
pub fn is_managed_host(host: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    MANAGED_HOST_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

/// Loopback hosts and unix socket directories.
pub fn is_local_host(host: &str) -> bool {
    let host = host.trim();
    host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host.starts_with('/')
}

fn is_production(environment: Option<&str>) -> bool {
    environment.is_some_and(|env| {
        env.eq_ignore_ascii_case("production") || env.eq_ignore_ascii_case("prod")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_aliases() {
        assert_eq!("postgres".parse::<BackendKind>().unwrap(), BackendKind::Relational);
        assert_eq!("SQLite".parse::<BackendKind>().unwrap(), BackendKind::EmbeddedFile);
        assert_eq!(
            "restricted-sdk".parse::<BackendKind>().unwrap(),
            BackendKind::RestrictedSdk
        );
        assert!("mongo".parse::<BackendKind>().is_err());
    }

    #[test]
    fn managed_hosts_are_detected() {
        assert!(is_managed_host("db.abcdefgh.supabase.co"));
        assert!(is_managed_host("EP-COOL-1.us-east-2.aws.neon.tech"));
        assert!(is_managed_host("prod.c9akciq32.eu-west-1.rds.amazonaws.com"));
        assert!(!is_managed_host("localhost"));
        assert!(!is_managed_host("db.internal"));
    }

    #[test]
    fn summary_never_contains_credentials() {
        let config = DatabaseConfig {
            backend: BackendConfig::Relational(RelationalConfig {
                host: "db.example.com".into(),
                port: 5432,
                database: "app".into(),
                user: "svc".into(),
                password: Some("hunter2".into()),
                ssl: true,
                ssl_overridden: false,
                pool_max: 10,
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                from_url: false,
                options: BTreeMap::new(),
            }),
            environment: Some("production".into()),
            migrations_dir: "migrations".into(),
            auto_migrate: true,
        };
        let summary = config.summary();
        assert!(summary.has_password);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"backend\":\"relational\""));
    }
}
