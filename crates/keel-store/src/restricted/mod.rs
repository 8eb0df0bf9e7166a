//! Adapter for a hosted backend reachable only through a structured REST API.
//!
//! Arbitrary SQL cannot be executed.  `query` accepts the statement shapes
//! listed in [`statement`] and rejects everything else, and pending
//! migrations are refused rather than skipped.

pub mod client;
pub mod statement;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{BackendKind, RestrictedSdkConfig};
use crate::diagnostics::{
    ConnectTarget, FailureCategory, classify_message, is_missing_table, suggestions,
};
use crate::error::{DbError, DbResult};
use crate::migration::{LEDGER_TABLE, MigrationReport, MigrationRunner};
use crate::sql::sql_preview;
use crate::traits::{AdapterClient, DatabaseAdapter, Dialect, HealthReport, QueryResult};

pub use client::{Filter, FilterOp, HttpRestClient, Order, RestClient, SelectRequest};
pub use statement::Statement;

const BACKEND: &str = "restricted-sdk";

pub struct RestrictedSdkAdapter {
    config: RestrictedSdkConfig,
    migrations_dir: PathBuf,
    /// Client used instead of building an [`HttpRestClient`] on initialize.
    injected: Option<Arc<dyn RestClient>>,
    client: RwLock<Option<Arc<dyn RestClient>>>,
}

impl RestrictedSdkAdapter {
    pub fn new(config: RestrictedSdkConfig, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            migrations_dir: migrations_dir.into(),
            injected: None,
            client: RwLock::new(None),
        }
    }

    /// Use `client` for every call instead of the HTTP implementation.
    pub fn with_client(
        config: RestrictedSdkConfig,
        migrations_dir: impl Into<PathBuf>,
        client: Arc<dyn RestClient>,
    ) -> Self {
        Self {
            injected: Some(client),
            ..Self::new(config, migrations_dir)
        }
    }

    fn client(&self) -> DbResult<Arc<dyn RestClient>> {
        self.client
            .read()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or(DbError::NotInitialized)
    }

    fn ledger_probe() -> SelectRequest {
        SelectRequest {
            table: LEDGER_TABLE.to_string(),
            columns: vec!["id".to_string()],
            limit: Some(1),
            ..SelectRequest::default()
        }
    }
}

#[async_trait]
impl DatabaseAdapter for RestrictedSdkAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::RestrictedSdk
    }

    fn dialect(&self) -> Dialect {
        Dialect::Rest
    }

    fn is_initialized(&self) -> bool {
        self.client.read().map(|c| c.is_some()).unwrap_or(false)
    }

    fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    async fn initialize(&self) -> DbResult<()> {
        if self.is_initialized() {
            debug!("restricted-sdk adapter already initialized");
            return Ok(());
        }
        info!(url = %self.config.url, "connecting to hosted API");

        let client: Arc<dyn RestClient> = match &self.injected {
            Some(client) => Arc::clone(client),
            None => Arc::new(HttpRestClient::new(&self.config)?),
        };

        // The ledger doubles as the reachability and credentials probe.
        if let Err(e) = client.select(&Self::ledger_probe()).await {
            let message = e.to_string();
            if is_missing_table(&message, LEDGER_TABLE) {
                error!(error = %message, "hosted API has no migrations ledger");
                return Err(missing_ledger(message));
            }
            let category = classify_message(&message);
            error!(error = %message, %category, "hosted API probe failed");
            let target = ConnectTarget {
                host: self.config.url.clone(),
                ..ConnectTarget::default()
            };
            return Err(DbError::Connection {
                category,
                message,
                suggestions: suggestions(category, &target),
            });
        }

        *self.client.write().map_err(|_| poisoned())? = Some(client);
        info!("restricted-sdk adapter ready");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> DbResult<QueryResult> {
        let client = self.client()?;
        execute(client.as_ref(), sql, params).await
    }

    async fn get_client(&self) -> DbResult<Box<dyn AdapterClient>> {
        Ok(Box::new(RestSession {
            client: Some(self.client()?),
        }))
    }

    async fn close(&self) -> DbResult<()> {
        if self.client.write().map_err(|_| poisoned())?.take().is_some() {
            info!("restricted-sdk adapter closed");
        }
        Ok(())
    }

    /// Pending migrations cannot be applied through the API; report them
    /// instead of pretending the schema is current.
    async fn run_migrations(&self) -> DbResult<MigrationReport> {
        let plan = MigrationRunner::new(self, &self.migrations_dir).plan().await?;
        for finding in &plan.drifted {
            warn!(
                id = finding.id,
                file = %finding.filename,
                "migration changed after it was applied; it will not be re-run"
            );
        }

        if !plan.pending.is_empty() {
            let names: Vec<&str> = plan.pending.iter().map(|f| f.filename.as_str()).collect();
            warn!(pending = ?names, "restricted-sdk backend cannot apply migrations");
            return Err(DbError::Unsupported {
                backend: BACKEND,
                operation: format!(
                    "applying migrations ({}); run them in the provider's SQL console \
                     or set DATABASE_URL and run `keel migrate`",
                    names.join(", ")
                ),
            });
        }

        info!(total = plan.files.len(), "schema is up to date");
        Ok(MigrationReport {
            applied: Vec::new(),
            drifted: plan.drifted,
        })
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let outcome = match self.client() {
            Ok(client) => client.select(&Self::ledger_probe()).await.map(|_| ()),
            Err(e) => Err(e),
        };
        HealthReport::from_probe(self.kind(), started, outcome)
    }
}

/// The API answered but the ledger table is absent.
fn missing_ledger(message: String) -> DbError {
    DbError::Connection {
        category: FailureCategory::Other,
        message: format!("the `{LEDGER_TABLE}` ledger table does not exist ({message})"),
        suggestions: vec![
            format!(
                "Create the ledger in the provider's SQL console: {}",
                Dialect::Postgres.ledger_ddl().split_whitespace().collect::<Vec<_>>().join(" ")
            ),
            "Then apply the files in the migrations directory there, in order".to_string(),
        ],
    }
}

fn poisoned() -> DbError {
    DbError::Pool("adapter state lock poisoned".to_string())
}

/// Parse `sql` and dispatch it as a structured call.
async fn execute(client: &dyn RestClient, sql: &str, params: &[Value]) -> DbResult<QueryResult> {
    let statement = statement::parse(sql, params)?;
    debug!(
        sql = %sql_preview(sql),
        param_count = params.len(),
        table = %statement.table(),
        "dispatching statement"
    );

    let rows = match &statement {
        Statement::Select(request) => client.select(request).await?,
        Statement::Insert { table, rows } => client.insert(table, rows).await?,
        Statement::Update {
            table,
            values,
            filters,
        } => client.update(table, values, filters).await?,
        Statement::Delete { table, filters } => client.delete(table, filters).await?,
    };

    let fields = match &statement {
        Statement::Select(request) if !request.columns.is_empty() => request.columns.clone(),
        _ => rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default(),
    };
    Ok(QueryResult::from_rows(rows, fields))
}

/// Client handle for the API.  Holds no connection; release only detaches
/// the handle.
pub struct RestSession {
    client: Option<Arc<dyn RestClient>>,
}

#[async_trait]
impl AdapterClient for RestSession {
    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<QueryResult> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DbError::Pool("client already released".to_string()))?;
        execute(client.as_ref(), sql, params).await
    }

    fn release(&mut self) {
        self.client = None;
    }

    fn is_released(&self) -> bool {
        self.client.is_none()
    }
}
