//! The [`Database`] facade.
//!
//! One explicitly constructed value owns the configuration and, once
//! initialized, exactly one adapter.  Share it with `Arc<Database>`; there is
//! no process-wide instance.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{
    BackendConfig, BackendKind, ConfigResolver, ConfigSummary, DatabaseConfig, ValidationReport,
    describe_setup, validate,
};
use crate::embedded::SqliteAdapter;
use crate::error::{DbError, DbResult};
use crate::migration::{MigrationReport, MigrationStatus, ValidationFindings};
use crate::relational::PostgresAdapter;
use crate::restricted::{RestClient, RestrictedSdkAdapter};
use crate::sql::sql_preview;
use crate::traits::{AdapterClient, DatabaseAdapter, HealthReport, QueryResult};

pub struct Database {
    config: DatabaseConfig,
    adapter: RwLock<Option<Arc<dyn DatabaseAdapter>>>,
    /// Serializes initialize and close.
    lifecycle: Mutex<()>,
    rest_client: Option<Arc<dyn RestClient>>,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            adapter: RwLock::new(None),
            lifecycle: Mutex::new(()),
            rest_client: None,
        }
    }

    /// Resolve the configuration from the process environment.
    pub fn from_env() -> DbResult<Self> {
        ConfigResolver::from_env().resolve().map(Self::new)
    }

    /// Route restricted-backend calls through `client` instead of HTTP.
    pub fn with_rest_client(mut self, client: Arc<dyn RestClient>) -> Self {
        self.rest_client = Some(client);
        self
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn kind(&self) -> BackendKind {
        self.config.kind()
    }

    pub fn is_initialized(&self) -> bool {
        self.adapter.read().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Validate the configuration, connect the selected adapter and, when
    /// auto-migrate is on, apply pending migrations.
    ///
    /// A second call while initialized is a no-op.  On failure nothing stays
    /// connected and the call may be retried.
    pub async fn initialize(&self) -> DbResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_initialized() {
            debug!("database already initialized");
            return Ok(());
        }

        let report = self.validate_config();
        for warning in &report.warnings {
            warn!(warning = %warning, "database configuration warning");
        }
        if !report.is_valid() {
            for err in &report.errors {
                error!(error = %err, "database configuration error");
            }
            return Err(DbError::Config {
                errors: report.errors,
                guide: describe_setup(&self.config),
            });
        }

        let adapter = self.build_adapter();
        info!(backend = %adapter.kind(), "initializing database");
        adapter.initialize().await?;

        if self.config.auto_migrate {
            match adapter.run_migrations().await {
                Ok(report) if !report.applied.is_empty() => {
                    info!(applied = report.applied.len(), "migrations applied during startup");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "startup migrations failed");
                    if let Err(close_err) = adapter.close().await {
                        warn!(error = %close_err, "closing adapter after failed startup");
                    }
                    return Err(e);
                }
            }
        }

        *self.adapter.write().map_err(|_| poisoned())? = Some(adapter);
        info!(backend = %self.kind(), "database ready");
        Ok(())
    }

    fn build_adapter(&self) -> Arc<dyn DatabaseAdapter> {
        let dir = self.config.migrations_dir.clone();
        match &self.config.backend {
            BackendConfig::Relational(rel) => Arc::new(PostgresAdapter::new(rel.clone(), dir)),
            BackendConfig::RestrictedSdk(sdk) => match &self.rest_client {
                Some(client) => Arc::new(RestrictedSdkAdapter::with_client(
                    sdk.clone(),
                    dir,
                    Arc::clone(client),
                )),
                None => Arc::new(RestrictedSdkAdapter::new(sdk.clone(), dir)),
            },
            BackendConfig::EmbeddedFile(file) => Arc::new(SqliteAdapter::new(file.clone(), dir)),
        }
    }

    fn adapter(&self) -> DbResult<Arc<dyn DatabaseAdapter>> {
        self.adapter
            .read()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or(DbError::NotInitialized)
    }

    // ── data operations ──────────────────────────────────────────────

    pub async fn query(&self, sql: &str, params: &[Value]) -> DbResult<QueryResult> {
        let adapter = self.adapter()?;
        let started = Instant::now();
        let result = adapter.query(sql, params).await;
        match &result {
            Ok(out) => debug!(
                sql = %sql_preview(sql),
                param_count = params.len(),
                rows = out.row_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query complete"
            ),
            Err(e) => warn!(
                sql = %sql_preview(sql),
                param_count = params.len(),
                error = %e,
                "query failed"
            ),
        }
        result
    }

    /// Check out a client for multi-statement work.  Release it when done.
    pub async fn get_client(&self) -> DbResult<Box<dyn AdapterClient>> {
        self.adapter()?.get_client().await
    }

    pub async fn run_migrations(&self) -> DbResult<MigrationReport> {
        self.adapter()?.run_migrations().await
    }

    pub async fn migration_status(&self) -> DbResult<MigrationStatus> {
        self.adapter()?.migration_status().await
    }

    pub async fn validate_migrations(&self) -> DbResult<ValidationFindings> {
        self.adapter()?.validate_migrations().await
    }

    /// Never fails; an uninitialized database reports unhealthy.
    pub async fn health_check(&self) -> HealthReport {
        match self.adapter() {
            Ok(adapter) => adapter.health_check().await,
            Err(e) => HealthReport::from_probe(self.kind(), Instant::now(), Err(e)),
        }
    }

    /// Tear down the adapter.  Idempotent; `initialize` may be called again.
    pub async fn close(&self) -> DbResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let adapter = self.adapter.write().map_err(|_| poisoned())?.take();
        if let Some(adapter) = adapter {
            adapter.close().await?;
            info!(backend = %self.kind(), "database closed");
        }
        Ok(())
    }

    // ── configuration ────────────────────────────────────────────────

    pub fn validate_config(&self) -> ValidationReport {
        validate(&self.config)
    }

    /// Redacted configuration, safe to log or serve.
    pub fn config_summary(&self) -> ConfigSummary {
        self.config.summary()
    }

    pub fn setup_instructions(&self) -> String {
        describe_setup(&self.config)
    }
}

fn poisoned() -> DbError {
    DbError::Pool("database state lock poisoned".to_string())
}
