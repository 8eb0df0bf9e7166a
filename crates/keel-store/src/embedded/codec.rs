//! JSON parameter binding and row decoding for SQLite.

use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::types::Json;
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};
use tracing::warn;

use crate::error::{DbError, DbResult};
use crate::sql::{hex, returns_rows, sql_preview};
use crate::traits::{QueryResult, Row};

pub(crate) async fn run(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[Value],
) -> DbResult<QueryResult> {
    let query = params.iter().fold(sqlx::query(sql), bind);

    if returns_rows(sql) {
        let rows = query.fetch_all(&mut *conn).await.inspect_err(|e| {
            warn!(error = %e, sql = %sql_preview(sql), "query failed");
        })?;
        let fields = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows.iter().map(decode_row).collect::<DbResult<Vec<_>>>()?;
        Ok(QueryResult::from_rows(rows, fields))
    } else {
        let done = query.execute(&mut *conn).await.inspect_err(|e| {
            warn!(error = %e, sql = %sql_preview(sql), "statement failed");
        })?;
        Ok(QueryResult::affected(done.rows_affected()))
    }
}

fn bind<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => query.bind(i),
            (None, Some(f)) => query.bind(f),
            (None, None) => query.bind(n.to_string()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(Json(other.clone())),
    }
}

/// Values are decoded by their storage class, not the declared column type.
fn decode_row(row: &SqliteRow) -> DbResult<Row> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index).map_err(|e| {
            DbError::Query(format!("column `{}` could not be decoded: {e}", column.name()))
        })?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_column(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();

    match storage.as_str() {
        "INTEGER" => row.try_get::<i64, _>(index).map(Value::from),
        "REAL" => row
            .try_get::<f64, _>(index)
            .map(|v| Number::from_f64(v).map_or(Value::Null, Value::Number)),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|b| Value::String(hex(&b))),
        "BOOLEAN" => row.try_get::<bool, _>(index).map(Value::Bool),
        _ => row.try_get::<String, _>(index).map(Value::String),
    }
}
