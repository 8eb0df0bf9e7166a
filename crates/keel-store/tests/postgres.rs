//! PostgreSQL integration tests.
//!
//! Opt-in: set `DATABASE_URL` to a disposable PostgreSQL database.  Without
//! it every test returns early.  Each test works inside its own schema,
//! selected through `search_path` and dropped at the end.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keel_store::{ConfigResolver, Database, DatabaseConfig, DbError, FailureCategory};
use serde_json::{Value, json};
use tempfile::TempDir;

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn database_url() -> Option<String> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if url.starts_with("postgres") => Some(url),
        _ => {
            eprintln!("DATABASE_URL is not a postgres:// URL; skipping");
            None
        }
    }
}

fn write_migration(dir: &Path, name: &str, sql: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), sql).unwrap();
}

fn config(url: &str, migrations_dir: &Path, pool_max: u32) -> DatabaseConfig {
    let mut config = ConfigResolver::from_vars([
        ("DATABASE_URL", url.to_string()),
        ("APP_ENV", "test".to_string()),
        ("MIGRATIONS_DIR", migrations_dir.display().to_string()),
        ("DB_POOL_MAX", pool_max.to_string()),
    ])
    .resolve()
    .unwrap();
    config.auto_migrate = false;
    config
}

/// A private schema on the target database.
struct Scratch {
    schema: String,
    url: String,
    admin: Database,
    root: TempDir,
}

impl Scratch {
    async fn create() -> Option<Self> {
        let url = database_url()?;
        let root = tempfile::tempdir().unwrap();

        // A migration file on disk keeps the admin connection from
        // creating baseline tables in the default schema.
        let admin_dir = root.path().join("admin");
        write_migration(&admin_dir, "001_noop.sql", "SELECT 1;");
        let admin = Database::new(config(&url, &admin_dir, 2));
        admin.initialize().await.unwrap();

        let schema = format!("keel_test_{}", uuid::Uuid::now_v7().simple());
        admin
            .query(&format!("CREATE SCHEMA {schema}"), &[])
            .await
            .unwrap();
        let separator = if url.contains('?') { '&' } else { '?' };
        Some(Self {
            url: format!("{url}{separator}search_path={schema}"),
            schema,
            admin,
            root,
        })
    }

    fn migrations(&self) -> std::path::PathBuf {
        self.root.path().join("migrations")
    }

    fn database(&self, pool_max: u32) -> Database {
        Database::new(config(&self.url, &self.migrations(), pool_max))
    }

    async fn finish(self) {
        self.admin
            .query(&format!("DROP SCHEMA {} CASCADE", self.schema), &[])
            .await
            .unwrap();
        self.admin.close().await.unwrap();
    }
}

async fn count(db: &Database, sql: &str) -> i64 {
    let result = db.query(sql, &[]).await.unwrap();
    result.first_value("n").and_then(Value::as_i64).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Migrations
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn migrations_apply_once_in_numeric_order() {
    let Some(scratch) = Scratch::create().await else { return };
    let dir = scratch.migrations();
    write_migration(&dir, "001_items.sql", "CREATE TABLE items (id INT PRIMARY KEY);");
    write_migration(&dir, "002_seed.sql", "INSERT INTO items (id) VALUES (1), (2);");
    write_migration(&dir, "010_label.sql", "ALTER TABLE items ADD COLUMN label TEXT;");

    let db = scratch.database(5);
    db.initialize().await.unwrap();
    let report = db.run_migrations().await.unwrap();
    assert_eq!(
        report.applied,
        vec!["001_items.sql", "002_seed.sql", "010_label.sql"]
    );
    assert!(db.run_migrations().await.unwrap().applied.is_empty());

    assert_eq!(count(&db, "SELECT COUNT(*) AS n FROM items").await, 2);
    let ledger = db
        .query("SELECT id FROM migrations ORDER BY id", &[])
        .await
        .unwrap();
    let ids: Vec<&Value> = ledger.rows.iter().map(|r| &r["id"]).collect();
    assert_eq!(ids, vec![&json!(1), &json!(2), &json!(10)]);

    db.close().await.unwrap();
    scratch.finish().await;
}

#[tokio::test]
async fn failed_migration_rolls_back_its_ddl() {
    let Some(scratch) = Scratch::create().await else { return };
    let dir = scratch.migrations();
    write_migration(&dir, "001_first.sql", "CREATE TABLE first_table (id INT);");
    write_migration(
        &dir,
        "002_broken.sql",
        "CREATE TABLE second_table (id INT);\nINSERT INTO missing_table VALUES (1);",
    );
    write_migration(&dir, "003_third.sql", "CREATE TABLE third_table (id INT);");

    let db = scratch.database(5);
    db.initialize().await.unwrap();
    match db.run_migrations().await {
        Err(DbError::Migration { id, message, .. }) => {
            assert_eq!(id, 2);
            assert!(message.starts_with("statement 2 failed: "), "{message}");
        }
        other => panic!("expected a migration error, got {other:?}"),
    }

    let present = |table: &'static str| {
        format!(
            "SELECT COUNT(*) AS n FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = '{table}'"
        )
    };
    assert_eq!(count(&db, &present("first_table")).await, 1);
    assert_eq!(count(&db, &present("second_table")).await, 0);
    assert_eq!(count(&db, &present("third_table")).await, 0);

    let status = db.migration_status().await.unwrap();
    assert_eq!((status.executed, status.pending), (1, 2));
    db.close().await.unwrap();
    scratch.finish().await;
}

#[tokio::test]
async fn migration_with_its_own_transaction_records_atomically() {
    let Some(scratch) = Scratch::create().await else { return };
    write_migration(
        &scratch.migrations(),
        "001_wrapped.sql",
        "BEGIN;\nCREATE TABLE wrapped (id INT);\nCOMMIT;",
    );

    let db = scratch.database(5);
    db.initialize().await.unwrap();
    db.run_migrations().await.unwrap();
    assert_eq!(count(&db, "SELECT COUNT(*) AS n FROM wrapped").await, 0);
    assert_eq!(count(&db, "SELECT COUNT(*) AS n FROM migrations").await, 1);
    db.close().await.unwrap();
    scratch.finish().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Pooling and transactions
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_clients_never_exceed_pool_size() {
    let Some(scratch) = Scratch::create().await else { return };
    let db = Arc::new(scratch.database(5));
    db.initialize().await.unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks = (0..30).map(|i| {
        let db = Arc::clone(&db);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        async move {
            let mut client = db.get_client().await?;
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            let result = client.query("SELECT $1::bigint AS n", &[json!(i)]).await;
            tokio::time::sleep(Duration::from_millis(5)).await;

            active.fetch_sub(1, Ordering::SeqCst);
            client.release();
            result
        }
    });
    let results = futures::future::join_all(tasks).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().first_value("n"), Some(&json!(i)));
    }
    assert!(peak.load(Ordering::SeqCst) <= 5);
    db.close().await.unwrap();
    scratch.finish().await;
}

#[tokio::test]
async fn pooled_connections_never_carry_an_open_transaction() {
    let Some(scratch) = Scratch::create().await else { return };
    let db = scratch.database(1);
    db.initialize().await.unwrap();
    db.query("CREATE TABLE notes (body TEXT)", &[]).await.unwrap();

    assert!(matches!(
        db.query("BEGIN", &[]).await,
        Err(DbError::Unsupported { .. })
    ));

    // Released mid-transaction: the connection is discarded, not reused.
    let mut client = db.get_client().await.unwrap();
    client.query("BEGIN", &[]).await.unwrap();
    client
        .query("INSERT INTO notes (body) VALUES ('uncommitted')", &[])
        .await
        .unwrap();
    client.release();

    let mut client = db.get_client().await.unwrap();
    client.query("BEGIN", &[]).await.unwrap();
    client.query("COMMIT", &[]).await.unwrap();
    client.release();

    assert_eq!(count(&db, "SELECT COUNT(*) AS n FROM notes").await, 0);
    db.close().await.unwrap();
    scratch.finish().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Decoding and triage
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn numeric_results_are_decoded_exactly() {
    let Some(scratch) = Scratch::create().await else { return };
    let db = scratch.database(5);
    db.initialize().await.unwrap();

    db.query("CREATE TABLE usage (quantity BIGINT)", &[])
        .await
        .unwrap();
    db.query("INSERT INTO usage (quantity) VALUES (3), (4)", &[])
        .await
        .unwrap();
    let total = db
        .query("SELECT SUM(quantity) AS total FROM usage", &[])
        .await
        .unwrap();
    assert_eq!(total.first_value("total"), Some(&json!(7)));

    let price = db
        .query("SELECT 19.90::numeric AS price", &[])
        .await
        .unwrap();
    assert_eq!(price.first_value("price"), Some(&json!("19.90")));

    match db.query("SELECT interval '1 day' AS span", &[]).await {
        Err(DbError::Query(message)) => assert!(message.contains("INTERVAL"), "{message}"),
        other => panic!("expected a decode error, got {other:?}"),
    }
    db.close().await.unwrap();
    scratch.finish().await;
}

#[tokio::test]
async fn missing_database_is_triaged() {
    let Some(url) = database_url() else { return };
    let mut url = url::Url::parse(&url).unwrap();
    url.set_path("/keel_database_that_does_not_exist");
    let dir = tempfile::tempdir().unwrap();

    let db = Database::new(config(url.as_str(), dir.path(), 2));
    match db.initialize().await {
        Err(DbError::Connection { category, .. }) => {
            assert_eq!(category, FailureCategory::DatabaseMissing);
        }
        other => panic!("expected a connection error, got {other:?}"),
    }
}
