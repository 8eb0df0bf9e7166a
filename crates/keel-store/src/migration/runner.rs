//! Migration runner: discover, ensure ledger, diff, execute, record.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::{
    DriftFinding, LEDGER_TABLE, MigrationFile, MigrationFileStatus, MigrationRecord,
    MigrationReport, MigrationState, MigrationStatus, SequenceGap, ValidationFindings, discover,
    split_statements,
};
use crate::error::{DbError, DbResult};
use crate::sql::{TxControl, leading_keyword, sql_preview, tx_control};
use crate::traits::{AdapterClient, DatabaseAdapter, Dialect, Row};

/// Migration files diffed against the ledger.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    /// Every file on disk, ascending id.
    pub files: Vec<MigrationFile>,
    /// Ledger rows, ascending id.
    pub ledger: Vec<MigrationRecord>,
    /// Files without a ledger row, ascending id.
    pub pending: Vec<MigrationFile>,
    pub drifted: Vec<DriftFinding>,
}

/// Runs the migrations in one directory against one adapter.
pub struct MigrationRunner<'a, A: DatabaseAdapter + ?Sized> {
    adapter: &'a A,
    dir: &'a Path,
}

impl<'a, A: DatabaseAdapter + ?Sized> MigrationRunner<'a, A> {
    pub fn new(adapter: &'a A, dir: &'a Path) -> Self {
        Self { adapter, dir }
    }

    /// Apply every pending migration in ascending id order.
    ///
    /// Each migration runs in its own transaction when the dialect supports
    /// transactional DDL.  The first failure rolls that migration back and
    /// aborts the run; migrations applied before it stay applied.  Drifted
    /// migrations are reported but never re-executed.
    pub async fn run(&self) -> DbResult<MigrationReport> {
        let files = discover(self.dir).await?;
        self.ensure_ledger().await?;
        let ledger = self.read_ledger().await?;
        let plan = diff(files, ledger);
        report_drift(&plan.drifted);

        if plan.pending.is_empty() {
            info!(total = plan.files.len(), "schema is up to date");
            return Ok(MigrationReport {
                applied: Vec::new(),
                drifted: plan.drifted,
            });
        }

        info!(
            pending = plan.pending.len(),
            dir = %self.dir.display(),
            "applying pending migrations"
        );
        let mut applied = Vec::with_capacity(plan.pending.len());
        for file in &plan.pending {
            self.apply(file).await?;
            applied.push(file.filename.clone());
        }
        info!(applied = applied.len(), "migrations complete");

        Ok(MigrationReport {
            applied,
            drifted: plan.drifted,
        })
    }

    /// Diff files against the ledger without changing anything.  A missing
    /// ledger table counts as an empty ledger.
    pub async fn plan(&self) -> DbResult<MigrationPlan> {
        let files = discover(self.dir).await?;
        let ledger = if self.ledger_exists().await? {
            self.read_ledger().await?
        } else {
            Vec::new()
        };
        Ok(diff(files, ledger))
    }

    pub async fn status(&self) -> DbResult<MigrationStatus> {
        let plan = self.plan().await?;
        let recorded: HashMap<u32, &MigrationRecord> =
            plan.ledger.iter().map(|r| (r.id, r)).collect();

        let files: Vec<MigrationFileStatus> = plan
            .files
            .iter()
            .map(|file| {
                let (state, executed_at) = match recorded.get(&file.id) {
                    Some(rec) if rec.checksum != file.checksum => {
                        (MigrationState::Modified, Some(rec.executed_at.clone()))
                    }
                    Some(rec) => (MigrationState::Executed, Some(rec.executed_at.clone())),
                    None => (MigrationState::Pending, None),
                };
                MigrationFileStatus {
                    id: file.id,
                    filename: file.filename.clone(),
                    state,
                    executed_at,
                }
            })
            .collect();

        let pending = files
            .iter()
            .filter(|f| f.state == MigrationState::Pending)
            .count();
        Ok(MigrationStatus {
            total: files.len(),
            executed: files.len() - pending,
            pending,
            files,
        })
    }

    /// Drift, ledger rows without files, and gaps in the file id sequence.
    pub async fn validate(&self) -> DbResult<ValidationFindings> {
        let plan = self.plan().await?;
        let on_disk: HashSet<u32> = plan.files.iter().map(|f| f.id).collect();

        let missing_files = plan
            .ledger
            .iter()
            .filter(|rec| !on_disk.contains(&rec.id))
            .cloned()
            .collect();
        let gaps = plan
            .files
            .windows(2)
            .filter(|pair| pair[1].id > pair[0].id + 1)
            .map(|pair| SequenceGap {
                after: pair[0].id,
                before: pair[1].id,
            })
            .collect();

        Ok(ValidationFindings {
            modified: plan.drifted,
            missing_files,
            gaps,
        })
    }

    // ── ledger ───────────────────────────────────────────────────────

    async fn ensure_ledger(&self) -> DbResult<()> {
        let dialect = self.adapter.dialect();
        if !dialect.executes_sql() {
            return Ok(());
        }
        self.adapter.query(dialect.ledger_ddl(), &[]).await?;
        Ok(())
    }

    async fn ledger_exists(&self) -> DbResult<bool> {
        let dialect = self.adapter.dialect();
        if !dialect.executes_sql() {
            return Ok(true);
        }
        let result = self
            .adapter
            .query(dialect.table_exists_sql(), &[json!(LEDGER_TABLE)])
            .await?;
        Ok(result.row_count > 0)
    }

    async fn read_ledger(&self) -> DbResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT id, filename, executed_at, checksum FROM {LEDGER_TABLE} ORDER BY id ASC"
        );
        let result = self.adapter.query(&sql, &[]).await?;
        let mut records = result
            .rows
            .iter()
            .map(record_from_row)
            .collect::<DbResult<Vec<_>>>()?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    // ── execution ────────────────────────────────────────────────────

    async fn apply(&self, file: &MigrationFile) -> DbResult<()> {
        let statements = split_statements(&file.content);
        info!(
            id = file.id,
            file = %file.filename,
            statements = statements.len(),
            "applying migration"
        );

        let mut client = self.adapter.get_client().await?;
        let outcome = self.apply_on(client.as_mut(), file, &statements).await;
        client.release();

        outcome.map_err(|e| {
            error!(id = file.id, file = %file.filename, error = %e, "migration failed");
            DbError::Migration {
                id: file.id,
                filename: file.filename.clone(),
                message: e.detail(),
            }
        })
    }

    async fn apply_on(
        &self,
        client: &mut dyn AdapterClient,
        file: &MigrationFile,
        statements: &[String],
    ) -> DbResult<()> {
        let dialect = self.adapter.dialect();
        let (body, offset, transactional) = match file_transaction(statements) {
            FileTransaction::None => (statements, 0, dialect.transactional_ddl()),
            FileTransaction::Outer if dialect.transactional_ddl() => {
                debug!(id = file.id, "migration's own BEGIN/COMMIT becomes the runner transaction");
                (&statements[1..statements.len() - 1], 1, true)
            }
            FileTransaction::Outer | FileTransaction::Managed => {
                info!(
                    id = file.id,
                    file = %file.filename,
                    "migration controls its own transactions; running it unwrapped"
                );
                (statements, 0, false)
            }
        };

        if transactional {
            client
                .query("BEGIN", &[])
                .await
                .map_err(|e| DbError::Transaction(format!("BEGIN failed: {}", e.detail())))?;
        }

        match execute_all(client, dialect, file, body, offset).await {
            Ok(()) => {
                if transactional {
                    client.query("COMMIT", &[]).await.map_err(|e| {
                        DbError::Transaction(format!("COMMIT failed: {}", e.detail()))
                    })?;
                }
                Ok(())
            }
            Err(e) => {
                match client.query("ROLLBACK", &[]).await {
                    Ok(_) => warn!(id = file.id, "migration rolled back"),
                    Err(rb) if transactional => {
                        error!(id = file.id, error = %rb, "rollback failed")
                    }
                    // unwrapped files usually have no transaction left open
                    Err(rb) => debug!(id = file.id, error = %rb, "nothing to roll back"),
                }
                Err(e)
            }
        }
    }
}

/// How a migration file uses transaction control statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileTransaction {
    /// No transaction control; the runner wraps the file.
    None,
    /// One `BEGIN` first and one `COMMIT` last around the whole file.
    Outer,
    /// Any other use of `BEGIN`, `COMMIT` or `ROLLBACK`.
    Managed,
}

fn file_transaction(statements: &[String]) -> FileTransaction {
    let controls: Vec<TxControl> = statements.iter().map(|s| tx_control(s)).collect();
    let count = controls.iter().filter(|c| **c != TxControl::None).count();
    if count == 0 {
        return FileTransaction::None;
    }
    let commits_last = statements
        .last()
        .is_some_and(|s| matches!(leading_keyword(s).as_str(), "COMMIT" | "END"));
    match (controls.first(), controls.last()) {
        (Some(TxControl::Begin), Some(TxControl::End)) if count == 2 && commits_last => {
            FileTransaction::Outer
        }
        _ => FileTransaction::Managed,
    }
}

/// Run `statements` and record the ledger row.  `offset` is the number of
/// file statements skipped before `statements[0]`, for error messages.
async fn execute_all(
    client: &mut dyn AdapterClient,
    dialect: Dialect,
    file: &MigrationFile,
    statements: &[String],
    offset: usize,
) -> DbResult<()> {
    for (index, statement) in statements.iter().enumerate() {
        let number = offset + index + 1;
        debug!(
            id = file.id,
            statement = number,
            sql = %sql_preview(statement),
            "executing migration statement"
        );
        client
            .query(statement, &[])
            .await
            .map_err(|e| DbError::Query(format!("statement {number} failed: {}", e.detail())))?;
    }

    let record = format!(
        "INSERT INTO {LEDGER_TABLE} (id, filename, checksum) VALUES ({}, {}, {})",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3),
    );
    client
        .query(
            &record,
            &[json!(file.id), json!(file.filename), json!(file.checksum)],
        )
        .await?;
    Ok(())
}

/// Pending files and drift findings for `files` against `ledger`.
fn diff(files: Vec<MigrationFile>, ledger: Vec<MigrationRecord>) -> MigrationPlan {
    let recorded: HashMap<u32, &MigrationRecord> = ledger.iter().map(|r| (r.id, r)).collect();
    let mut pending = Vec::new();
    let mut drifted = Vec::new();

    for file in &files {
        match recorded.get(&file.id) {
            None => pending.push(file.clone()),
            Some(rec) if rec.checksum != file.checksum => drifted.push(DriftFinding {
                id: file.id,
                filename: file.filename.clone(),
                recorded_checksum: rec.checksum.clone(),
                current_checksum: file.checksum.clone(),
            }),
            Some(_) => {}
        }
    }

    MigrationPlan {
        files,
        ledger,
        pending,
        drifted,
    }
}

fn report_drift(drifted: &[DriftFinding]) {
    for finding in drifted {
        warn!(
            id = finding.id,
            file = %finding.filename,
            recorded = %finding.recorded_checksum,
            current = %finding.current_checksum,
            "migration changed after it was applied; it will not be re-run"
        );
    }
}

fn record_from_row(row: &Row) -> DbResult<MigrationRecord> {
    let id = row
        .get("id")
        .and_then(value_as_u32)
        .ok_or_else(|| DbError::Query(format!("ledger row has no valid id: {row:?}")))?;
    Ok(MigrationRecord {
        id,
        filename: value_as_text(row.get("filename")),
        executed_at: value_as_text(row.get("executed_at")),
        checksum: value_as_text(row.get("checksum")),
    })
}

fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: u32, content: &str) -> MigrationFile {
        MigrationFile {
            id,
            filename: format!("{id:03}_m.sql"),
            content: content.to_string(),
            checksum: super::super::checksum(content),
        }
    }

    fn record(id: u32, checksum: &str) -> MigrationRecord {
        MigrationRecord {
            id,
            filename: format!("{id:03}_m.sql"),
            executed_at: "2024-01-01 00:00:00".to_string(),
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn diff_separates_pending_and_drift() {
        let files = vec![file(1, "a"), file(2, "b"), file(3, "c")];
        let ledger = vec![record(1, &files[0].checksum), record(2, "stale")];
        let plan = diff(files, ledger);
        assert_eq!(plan.pending.iter().map(|f| f.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(plan.drifted.len(), 1);
        assert_eq!(plan.drifted[0].id, 2);
        assert_eq!(plan.drifted[0].recorded_checksum, "stale");
    }

    fn stmts(sql: &[&str]) -> Vec<String> {
        sql.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn files_with_their_own_transaction_are_recognized() {
        assert_eq!(
            file_transaction(&stmts(&["CREATE TABLE a (id INT)", "INSERT INTO a VALUES (1)"])),
            FileTransaction::None
        );
        assert_eq!(
            file_transaction(&stmts(&["BEGIN", "CREATE TABLE a (id INT)", "COMMIT"])),
            FileTransaction::Outer
        );
        assert_eq!(
            file_transaction(&stmts(&["begin transaction", "CREATE TABLE a (id INT)", "END"])),
            FileTransaction::Outer
        );
        assert_eq!(
            file_transaction(&stmts(&["BEGIN", "CREATE TABLE a (id INT)", "ROLLBACK"])),
            FileTransaction::Managed
        );
        assert_eq!(
            file_transaction(&stmts(&[
                "BEGIN",
                "CREATE TABLE a (id INT)",
                "COMMIT",
                "BEGIN",
                "CREATE TABLE b (id INT)",
                "COMMIT",
            ])),
            FileTransaction::Managed
        );
        assert_eq!(
            file_transaction(&stmts(&["CREATE TABLE a (id INT)", "COMMIT"])),
            FileTransaction::Managed
        );
    }

    #[test]
    fn ledger_rows_accept_numbers_and_strings() {
        let mut row = Row::new();
        row.insert("id".into(), json!("7"));
        row.insert("filename".into(), json!("007_x.sql"));
        row.insert("executed_at".into(), Value::Null);
        row.insert("checksum".into(), json!("abc"));
        let rec = record_from_row(&row).unwrap();
        assert_eq!(rec.id, 7);
        assert_eq!(rec.executed_at, "");

        row.insert("id".into(), json!(-1));
        assert!(record_from_row(&row).is_err());
    }
}
