//! Statement-head inspection shared by the SQL-executing adapters.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::BackendKind;
use crate::error::{DbError, DbResult};

/// Longest SQL prefix written to logs.
pub(crate) const SQL_LOG_LIMIT: usize = 200;

static RETURNING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bRETURNING\b").expect("returning pattern"));

/// First [`SQL_LOG_LIMIT`] characters of `sql`, whitespace collapsed.
pub(crate) fn sql_preview(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SQL_LOG_LIMIT {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(SQL_LOG_LIMIT).collect();
    out.push('…');
    out
}

/// Lowercase hex encoding.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Upper-cased first keyword, skipping whitespace, comments and parentheses.
pub(crate) fn leading_keyword(sql: &str) -> String {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Whether the statement produces a result set.
pub(crate) fn returns_rows(sql: &str) -> bool {
    matches!(
        leading_keyword(sql).as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "EXPLAIN" | "PRAGMA" | "TABLE"
    ) || RETURNING.is_match(sql)
}

/// Effect of a statement on an explicitly opened transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxControl {
    Begin,
    End,
    None,
}

pub(crate) fn tx_control(sql: &str) -> TxControl {
    let keyword = leading_keyword(sql);
    match keyword.as_str() {
        "BEGIN" | "START" => TxControl::Begin,
        "COMMIT" | "END" => TxControl::End,
        "ROLLBACK" if !sql.to_ascii_uppercase().contains(" TO ") => TxControl::End,
        _ => TxControl::None,
    }
}

/// Refuse statements that would leave a pooled connection inside a
/// transaction after a single-shot `query`.
pub(crate) fn ensure_single_shot(sql: &str, backend: BackendKind) -> DbResult<()> {
    if tx_control(sql) == TxControl::Begin || leading_keyword(sql) == "SAVEPOINT" {
        return Err(DbError::Unsupported {
            backend: backend.as_str(),
            operation: format!(
                "`{}` through query(); open transactions on a client from get_client()",
                sql_preview(sql)
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_preview_truncates_and_collapses() {
        assert_eq!(sql_preview("SELECT  1\n FROM t"), "SELECT 1 FROM t");
        let long = format!("SELECT '{}'", "x".repeat(500));
        let preview = sql_preview(&long);
        assert_eq!(preview.chars().count(), SQL_LOG_LIMIT + 1);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn result_sets_are_detected() {
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("-- note\nWITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(returns_rows("(SELECT 1) UNION (SELECT 2)"));
        assert!(returns_rows("INSERT INTO t (a) VALUES ($1) RETURNING id"));
        assert!(!returns_rows("INSERT INTO t (a) VALUES ($1)"));
        assert!(!returns_rows("/* ddl */ CREATE TABLE t (id INT)"));
    }

    #[test]
    fn transaction_control_statements() {
        assert_eq!(tx_control("BEGIN"), TxControl::Begin);
        assert_eq!(tx_control("begin immediate"), TxControl::Begin);
        assert_eq!(tx_control("COMMIT"), TxControl::End);
        assert_eq!(tx_control("ROLLBACK"), TxControl::End);
        assert_eq!(tx_control("ROLLBACK TO SAVEPOINT a"), TxControl::None);
        assert_eq!(tx_control("SELECT 1"), TxControl::None);
    }

    #[test]
    fn single_shot_queries_cannot_open_transactions() {
        assert!(ensure_single_shot("SELECT 1", BackendKind::EmbeddedFile).is_ok());
        assert!(ensure_single_shot("COMMIT", BackendKind::EmbeddedFile).is_ok());
        assert!(matches!(
            ensure_single_shot(" begin", BackendKind::Relational),
            Err(DbError::Unsupported { backend: "relational", .. })
        ));
        assert!(ensure_single_shot("START TRANSACTION", BackendKind::Relational).is_err());
        assert!(ensure_single_shot("SAVEPOINT a", BackendKind::EmbeddedFile).is_err());
    }
}
