//! Embedded SQLite adapter.
//!
//! The non-production default and the engine the integration tests run on.
//! Same contract as the PostgreSQL adapter, including the baseline schema
//! path, over a bounded pool on one database file.

mod codec;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, Sqlite};
use tracing::{debug, error, info, warn};

use crate::bootstrap;
use crate::config::{BackendKind, EmbeddedFileConfig};
use crate::diagnostics::{
    ConnectTarget, FailureCategory, connect_timeout_error, connection_error, suggestions,
};
use crate::error::{DbError, DbResult};
use crate::sql::{TxControl, ensure_single_shot, sql_preview, tx_control};
use crate::traits::{AdapterClient, DatabaseAdapter, Dialect, QueryResult};

pub struct SqliteAdapter {
    config: EmbeddedFileConfig,
    migrations_dir: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteAdapter {
    pub fn new(config: EmbeddedFileConfig, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            migrations_dir: migrations_dir.into(),
            pool: RwLock::new(None),
        }
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn target(&self) -> ConnectTarget {
        let path = self.config.path.display().to_string();
        ConnectTarget {
            host: path.clone(),
            database: path,
            ..ConnectTarget::default()
        }
    }

    fn pool(&self) -> DbResult<SqlitePool> {
        self.pool
            .read()
            .map_err(|_| poisoned())?
            .clone()
            .ok_or(DbError::NotInitialized)
    }

    /// Open the file once outside the pool so the driver error reaches
    /// triage instead of a pool timeout.
    async fn probe(&self, options: &SqliteConnectOptions) -> DbResult<()> {
        let timeout = self.config.connect_timeout;
        let conn = match tokio::time::timeout(timeout, options.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(connection_error(&e, &self.target())),
            Err(_) => return Err(connect_timeout_error(&self.target(), timeout)),
        };
        if let Err(e) = conn.close().await {
            debug!(error = %e, "closing probe connection failed");
        }
        Ok(())
    }

    async fn verify(&self, pool: &SqlitePool) -> DbResult<()> {
        let conn = pool
            .acquire()
            .await
            .map_err(|e| connection_error(&e, &self.target()))?;
        let mut client = SqliteClient::new(conn);
        client.query("SELECT 1", &[]).await?;
        let outcome =
            bootstrap::ensure_baseline(Dialect::Sqlite, &self.migrations_dir, &mut client).await;
        client.release();
        outcome.map(|_| ())
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::EmbeddedFile
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn is_initialized(&self) -> bool {
        self.pool.read().map(|p| p.is_some()).unwrap_or(false)
    }

    fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    async fn initialize(&self) -> DbResult<()> {
        if self.is_initialized() {
            debug!("SQLite adapter already initialized");
            return Ok(());
        }

        let path = &self.config.path;
        info!(path = %path.display(), pool_max = self.config.pool_max, "opening SQLite database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                let category = FailureCategory::FileAccess;
                DbError::Connection {
                    category,
                    message: format!("cannot create {}: {e}", parent.display()),
                    suggestions: suggestions(category, &self.target()),
                }
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(self.config.connect_timeout);
        if let Err(e) = self.probe(&options).await {
            error!(error = %e, "SQLite open failed");
            return Err(e);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.config.pool_max)
            .acquire_timeout(self.config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                let err = connection_error(&e, &self.target());
                error!(error = %err, "SQLite open failed");
                err
            })?;

        if let Err(e) = self.verify(&pool).await {
            error!(error = %e, "SQLite initialization failed, closing pool");
            pool.close().await;
            return Err(e);
        }

        let stale = {
            let mut slot = self.pool.write().map_err(|_| poisoned())?;
            if slot.is_some() {
                Some(pool)
            } else {
                *slot = Some(pool);
                None
            }
        };
        if let Some(pool) = stale {
            pool.close().await;
        }

        info!(path = %path.display(), "SQLite adapter ready");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> DbResult<QueryResult> {
        let pool = self.pool()?;
        ensure_single_shot(sql, self.kind())?;
        debug!(sql = %sql_preview(sql), param_count = params.len(), "executing query");
        let mut conn = pool.acquire().await?;
        codec::run(&mut conn, sql, params).await
    }

    async fn get_client(&self) -> DbResult<Box<dyn AdapterClient>> {
        let conn = self.pool()?.acquire().await?;
        Ok(Box::new(SqliteClient::new(conn)))
    }

    async fn close(&self) -> DbResult<()> {
        let pool = self.pool.write().map_err(|_| poisoned())?.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(path = %self.config.path.display(), "SQLite pool closed");
        }
        Ok(())
    }
}

fn poisoned() -> DbError {
    DbError::Pool("adapter state lock poisoned".to_string())
}

/// One pooled SQLite connection.
pub struct SqliteClient {
    conn: Option<PoolConnection<Sqlite>>,
    in_transaction: bool,
}

impl SqliteClient {
    fn new(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            conn: Some(conn),
            in_transaction: false,
        }
    }
}

#[async_trait]
impl AdapterClient for SqliteClient {
    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<QueryResult> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::Pool("client already released".to_string()))?;
        debug!(sql = %sql_preview(sql), param_count = params.len(), "executing client query");
        let result = codec::run(conn, sql, params).await?;
        match tx_control(sql) {
            TxControl::Begin => self.in_transaction = true,
            TxControl::End => self.in_transaction = false,
            TxControl::None => {}
        }
        Ok(result)
    }

    fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if self.in_transaction {
                warn!("client released inside an open transaction; discarding connection");
                conn.close_on_drop();
            }
        }
    }

    fn is_released(&self) -> bool {
        self.conn.is_none()
    }
}

impl Drop for SqliteClient {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_POOL_MAX};

    fn adapter(dir: &Path) -> SqliteAdapter {
        sized(dir, DEFAULT_POOL_MAX)
    }

    fn sized(dir: &Path, pool_max: u32) -> SqliteAdapter {
        SqliteAdapter::new(
            EmbeddedFileConfig {
                path: dir.join("nested/app.db"),
                pool_max,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            },
            dir.join("migrations"),
        )
    }

    #[tokio::test]
    async fn operations_before_initialize_fail() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        assert!(matches!(
            adapter.query("SELECT 1", &[]).await,
            Err(DbError::NotInitialized)
        ));
        assert!(matches!(
            adapter.get_client().await,
            Err(DbError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn params_and_rows_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.initialize().await.unwrap();
        assert!(dir.path().join("nested/app.db").exists());

        adapter
            .query(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, tags TEXT)",
                &[],
            )
            .await
            .unwrap();
        let inserted = adapter
            .query(
                "INSERT INTO items (id, name, price, tags) VALUES (?1, ?2, ?3, ?4)",
                &[
                    Value::from(1),
                    Value::from("widget"),
                    Value::from(2.5),
                    serde_json::json!(["a", "b"]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted.row_count, 1);

        let rows = adapter
            .query(
                "SELECT id, name, price, tags, NULL AS missing FROM items WHERE id = ?1",
                &[Value::from(1)],
            )
            .await
            .unwrap();
        assert_eq!(rows.fields, vec!["id", "name", "price", "tags", "missing"]);
        assert_eq!(rows.first_value("id"), Some(&Value::from(1)));
        assert_eq!(rows.first_value("name"), Some(&Value::from("widget")));
        assert_eq!(rows.first_value("price"), Some(&Value::from(2.5)));
        assert_eq!(rows.first_value("tags"), Some(&Value::from("[\"a\",\"b\"]")));
        assert_eq!(rows.first_value("missing"), Some(&Value::Null));

        adapter.close().await.unwrap();
        adapter.close().await.unwrap();
        assert!(!adapter.is_initialized());
    }

    #[tokio::test]
    async fn double_release_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.initialize().await.unwrap();
        let mut client = adapter.get_client().await.unwrap();
        client.query("SELECT 1", &[]).await.unwrap();
        client.release();
        client.release();
        assert!(client.is_released());
        assert!(client.query("SELECT 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn single_shot_query_cannot_leave_a_transaction_open() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = sized(dir.path(), 1);
        adapter.initialize().await.unwrap();
        adapter
            .query("CREATE TABLE notes (body TEXT)", &[])
            .await
            .unwrap();

        assert!(matches!(
            adapter.query("BEGIN", &[]).await,
            Err(DbError::Unsupported { .. })
        ));
        adapter
            .query("INSERT INTO notes (body) VALUES ('kept')", &[])
            .await
            .unwrap();

        // The only pooled connection must not be mid-transaction.
        let mut client = adapter.get_client().await.unwrap();
        client.query("BEGIN", &[]).await.unwrap();
        client
            .query("INSERT INTO notes (body) VALUES ('dropped')", &[])
            .await
            .unwrap();
        client.query("ROLLBACK", &[]).await.unwrap();
        client.release();

        let rows = adapter
            .query("SELECT body FROM notes ORDER BY body", &[])
            .await
            .unwrap();
        assert_eq!(rows.row_count, 1);
        assert_eq!(rows.first_value("body"), Some(&Value::from("kept")));
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn client_released_mid_transaction_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = sized(dir.path(), 1);
        adapter.initialize().await.unwrap();
        adapter
            .query("CREATE TABLE notes (body TEXT)", &[])
            .await
            .unwrap();

        let mut client = adapter.get_client().await.unwrap();
        client.query("BEGIN", &[]).await.unwrap();
        client
            .query("INSERT INTO notes (body) VALUES ('uncommitted')", &[])
            .await
            .unwrap();
        client.release();

        let rows = adapter
            .query("SELECT COUNT(*) AS n FROM notes", &[])
            .await
            .unwrap();
        assert_eq!(rows.first_value("n"), Some(&Value::from(0)));
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn unopenable_file_is_triaged_as_file_access() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the database directory should be.
        std::fs::write(dir.path().join("nested"), b"not a directory").unwrap();
        let adapter = adapter(dir.path());
        match adapter.initialize().await {
            Err(DbError::Connection { category, .. }) => {
                assert_eq!(category, FailureCategory::FileAccess);
            }
            other => panic!("expected a file access failure, got {other:?}"),
        }
        assert!(!adapter.is_initialized());
    }
}
