//! JSON parameter binding and row decoding for PostgreSQL.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Number, Value};
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::types::{Decimal, Json};
use sqlx::{Column, Postgres, Row as _, TypeInfo, ValueRef};
use tracing::warn;

use crate::error::{DbError, DbResult};
use crate::sql::{hex, returns_rows, sql_preview};
use crate::traits::{QueryResult, Row};

/// Execute one statement on `conn`.
pub(crate) async fn run(
    conn: &mut PgConnection,
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

/// Bind one JSON parameter.  `null` is sent as untyped-text NULL; arrays and
/// objects are sent as JSONB.
fn bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
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

fn decode_row(row: &PgRow) -> DbResult<Row> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name()).map_err(|e| {
            DbError::Query(format!(
                "column `{}` ({}) could not be decoded: {e}",
                column.name(),
                column.type_info().name()
            ))
        })?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Decode one column by its PostgreSQL type name.  Types without a mapping
/// are an error rather than a silent `null`; cast them to text in SQL.
fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    match type_name {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(Value::from),
        "INT4" => row.try_get::<i32, _>(index).map(Value::from),
        "INT8" => row.try_get::<i64, _>(index).map(Value::from),
        "OID" => row.try_get::<Oid, _>(index).map(|o| Value::from(o.0)),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| float(f64::from(v))),
        "FLOAT8" => row.try_get::<f64, _>(index).map(float),
        "NUMERIC" => row.try_get::<Decimal, _>(index).map(numeric),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
            row.try_get::<String, _>(index).map(Value::String)
        }
        "JSON" | "JSONB" => row.try_get::<Json<Value>, _>(index).map(|j| j.0),
        "TIMESTAMPTZ" => row
            .try_get::<DateTime<Utc>, _>(index)
            .map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|d| Value::String(d.to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|t| Value::String(t.to_string())),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(index)
            .map(|u| Value::String(u.to_string())),
        "BYTEA" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|b| Value::String(hex(&b))),
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Vec<String>, _>(index)
            .map(|v| Value::Array(v.into_iter().map(Value::String).collect())),
        "INT4[]" => row
            .try_get::<Vec<i32>, _>(index)
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        "INT8[]" => row
            .try_get::<Vec<i64>, _>(index)
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        "BOOL[]" => row
            .try_get::<Vec<bool>, _>(index)
            .map(|v| Value::Array(v.into_iter().map(Value::Bool).collect())),
        other => Err(sqlx::Error::Decode(
            format!("no JSON mapping for type {other}; cast the column to text").into(),
        )),
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

/// Integral decimals that fit in `i64` become numbers; everything else keeps
/// its exact text.
fn numeric(d: Decimal) -> Value {
    let text = d.normalize().to_string();
    match text.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(d.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn integral_numerics_become_numbers() {
        assert_eq!(numeric(Decimal::from(42)), Value::from(42));
        assert_eq!(numeric(Decimal::from_str("1200.00").unwrap()), Value::from(1200));
    }

    #[test]
    fn fractional_and_wide_numerics_keep_their_text() {
        assert_eq!(
            numeric(Decimal::from_str("19.90").unwrap()),
            Value::from("19.90")
        );
        assert_eq!(
            numeric(Decimal::from_str("92233720368547758070").unwrap()),
            Value::from("92233720368547758070")
        );
    }
}
