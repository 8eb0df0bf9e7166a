//! Statement-shape dispatcher.
//!
//! Recognizes the handful of single-table statement shapes the hosted API
//! can express and turns them into structured calls:
//!
//! ```text
//! SELECT cols|* FROM t [WHERE cond [AND cond]...] [ORDER BY c [ASC|DESC]] [LIMIT n]
//! INSERT INTO t (cols) VALUES (vals)[, (vals)...] [RETURNING ...]
//! UPDATE t SET c = v[, ...] WHERE cond [AND cond]... [RETURNING ...]
//! DELETE FROM t WHERE cond [AND cond]... [RETURNING ...]
//! ```
//!
//! A condition is `col <op> value` (`=`, `!=`, `<>`, `<`, `<=`, `>`, `>=`) or
//! `col IS [NOT] NULL`.  Values are `$n` placeholders or literals.  Anything
//! else is rejected with [`DbError::Unsupported`]; nothing is ever silently
//! turned into an empty result.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Number, Value};

use super::client::{Filter, FilterOp, Order, SelectRequest};
use crate::error::{DbError, DbResult};
use crate::sql::sql_preview;
use crate::traits::Row;

static IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:"([A-Za-z_][A-Za-z0-9_]*)"|([A-Za-z_][A-Za-z0-9_]*))"#)
        .expect("identifier pattern")
});

static VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\$(\d+)|'((?:[^']|'')*)'|(-?\d+\.\d+(?:[eE][-+]?\d+)?)|(-?\d+)|(?i:(true|false|null))\b)",
    )
    .expect("value pattern")
});

static OPERATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(<>|!=|<=|>=|=|<|>)").expect("operator pattern"));

static IS_NULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?i:IS\s+(NOT\s+)?NULL)\b").expect("null check pattern"));

/// A statement the hosted API can execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectRequest),
    Insert {
        table: String,
        rows: Vec<Row>,
    },
    Update {
        table: String,
        values: Row,
        filters: Vec<Filter>,
    },
    Delete {
        table: String,
        filters: Vec<Filter>,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Self::Select(request) => &request.table,
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }
}

/// Parse `sql` with positional `params` (`$1` is `params[0]`).
pub fn parse(sql: &str, params: &[Value]) -> DbResult<Statement> {
    let mut cursor = Cursor {
        sql,
        rest: sql,
        params,
    };

    let statement = if cursor.keyword("SELECT") {
        parse_select(&mut cursor)?
    } else if cursor.keyword("INSERT") {
        parse_insert(&mut cursor)?
    } else if cursor.keyword("UPDATE") {
        parse_update(&mut cursor)?
    } else if cursor.keyword("DELETE") {
        parse_delete(&mut cursor)?
    } else {
        return Err(cursor.reject("statement type"));
    };

    if !cursor.at_end() {
        return Err(cursor.reject("trailing clause"));
    }
    Ok(statement)
}

fn parse_select(c: &mut Cursor<'_>) -> DbResult<Statement> {
    let columns = if c.punct('*') {
        Vec::new()
    } else {
        c.ident_list()?
    };
    c.expect_keyword("FROM")?;
    let table = c.ident()?;

    let filters = if c.keyword("WHERE") {
        c.conditions()?
    } else {
        Vec::new()
    };

    let order = if c.keyword("ORDER") {
        c.expect_keyword("BY")?;
        let column = c.ident()?;
        let descending = if c.keyword("DESC") {
            true
        } else {
            c.keyword("ASC");
            false
        };
        Some(Order { column, descending })
    } else {
        None
    };

    let limit = if c.keyword("LIMIT") {
        match c.value()? {
            Value::Number(n) if n.as_u64().is_some() => n.as_u64(),
            _ => return Err(c.reject("non-integer LIMIT")),
        }
    } else {
        None
    };

    Ok(Statement::Select(SelectRequest {
        table,
        columns,
        filters,
        order,
        limit,
    }))
}

fn parse_insert(c: &mut Cursor<'_>) -> DbResult<Statement> {
    c.expect_keyword("INTO")?;
    let table = c.ident()?;
    c.expect_punct('(')?;
    let columns = c.ident_list()?;
    c.expect_punct(')')?;
    c.expect_keyword("VALUES")?;

    let mut rows = Vec::new();
    loop {
        c.expect_punct('(')?;
        let mut values = vec![c.value()?];
        while c.punct(',') {
            values.push(c.value()?);
        }
        c.expect_punct(')')?;
        if values.len() != columns.len() {
            return Err(c.reject("column and value counts differ"));
        }
        rows.push(columns.iter().cloned().zip(values).collect::<Row>());
        if !c.punct(',') {
            break;
        }
    }

    c.returning()?;
    Ok(Statement::Insert { table, rows })
}

fn parse_update(c: &mut Cursor<'_>) -> DbResult<Statement> {
    let table = c.ident()?;
    c.expect_keyword("SET")?;
    let mut values = Row::new();
    loop {
        let column = c.ident()?;
        c.expect_punct('=')?;
        values.insert(column, c.value()?);
        if !c.punct(',') {
            break;
        }
    }
    if !c.keyword("WHERE") {
        return Err(c.reject("UPDATE without WHERE"));
    }
    let filters = c.conditions()?;
    c.returning()?;
    Ok(Statement::Update {
        table,
        values,
        filters,
    })
}

fn parse_delete(c: &mut Cursor<'_>) -> DbResult<Statement> {
    c.expect_keyword("FROM")?;
    let table = c.ident()?;
    if !c.keyword("WHERE") {
        return Err(c.reject("DELETE without WHERE"));
    }
    let filters = c.conditions()?;
    c.returning()?;
    Ok(Statement::Delete { table, filters })
}

// ── cursor ───────────────────────────────────────────────────────────

struct Cursor<'s> {
    sql: &'s str,
    rest: &'s str,
    params: &'s [Value],
}

impl<'s> Cursor<'s> {
    fn reject(&self, what: &str) -> DbError {
        DbError::Unsupported {
            backend: "restricted-sdk",
            operation: format!("{what} in `{}`", sql_preview(self.sql)),
        }
    }

    fn at_end(&self) -> bool {
        self.rest.trim().trim_end_matches(';').trim().is_empty()
    }

    fn keyword(&mut self, keyword: &str) -> bool {
        let trimmed = self.rest.trim_start();
        let Some(head) = trimmed.get(..keyword.len()) else {
            return false;
        };
        if !head.eq_ignore_ascii_case(keyword) {
            return false;
        }
        let after = &trimmed[keyword.len()..];
        if after
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return false;
        }
        self.rest = after;
        true
    }

    fn expect_keyword(&mut self, keyword: &str) -> DbResult<()> {
        if self.keyword(keyword) {
            Ok(())
        } else {
            Err(self.reject(&format!("expected {keyword}")))
        }
    }

    fn punct(&mut self, ch: char) -> bool {
        match self.rest.trim_start().strip_prefix(ch) {
            Some(after) => {
                self.rest = after;
                true
            }
            None => false,
        }
    }

    fn expect_punct(&mut self, ch: char) -> DbResult<()> {
        if self.punct(ch) {
            Ok(())
        } else {
            Err(self.reject(&format!("expected `{ch}`")))
        }
    }

    fn take(&mut self, pattern: &Regex) -> Option<Captures<'s>> {
        let caps = pattern.captures(self.rest)?;
        let end = caps.get(0)?.end();
        self.rest = &self.rest[end..];
        Some(caps)
    }

    fn ident(&mut self) -> DbResult<String> {
        self.take(&IDENT)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| self.reject("expected an identifier"))
    }

    fn ident_list(&mut self) -> DbResult<Vec<String>> {
        let mut names = vec![self.ident()?];
        while self.punct(',') {
            names.push(self.ident()?);
        }
        Ok(names)
    }

    fn value(&mut self) -> DbResult<Value> {
        let Some(caps) = self.take(&VALUE) else {
            return Err(self.reject("expected a value"));
        };
        if let Some(index) = caps.get(1) {
            let index: usize = index.as_str().parse().unwrap_or(0);
            return index
                .checked_sub(1)
                .and_then(|i| self.params.get(i))
                .cloned()
                .ok_or_else(|| {
                    DbError::Query(format!(
                        "placeholder ${index} has no parameter ({} supplied)",
                        self.params.len()
                    ))
                });
        }
        if let Some(text) = caps.get(2) {
            return Ok(Value::String(text.as_str().replace("''", "'")));
        }
        if let Some(float) = caps.get(3) {
            return float
                .as_str()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| self.reject("invalid number"));
        }
        if let Some(int) = caps.get(4) {
            return int
                .as_str()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| self.reject("invalid integer"));
        }
        match caps.get(5).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
            Some("true") => Ok(Value::Bool(true)),
            Some("false") => Ok(Value::Bool(false)),
            _ => Ok(Value::Null),
        }
    }

    fn conditions(&mut self) -> DbResult<Vec<Filter>> {
        let mut filters = Vec::new();
        loop {
            let column = self.ident()?;
            if let Some(caps) = self.take(&IS_NULL) {
                let op = if caps.get(1).is_some() {
                    FilterOp::IsNotNull
                } else {
                    FilterOp::IsNull
                };
                filters.push(Filter {
                    column,
                    op,
                    value: Value::Null,
                });
            } else {
                let op = match self.take(&OPERATOR).as_ref().map(|caps| &caps[1]) {
                    Some("=") => FilterOp::Eq,
                    Some("!=" | "<>") => FilterOp::Neq,
                    Some("<") => FilterOp::Lt,
                    Some("<=") => FilterOp::Lte,
                    Some(">") => FilterOp::Gt,
                    Some(">=") => FilterOp::Gte,
                    _ => return Err(self.reject("expected a comparison")),
                };
                let value = self.value()?;
                if value.is_null() {
                    return Err(self.reject("comparison with NULL (use IS NULL)"));
                }
                filters.push(Filter { column, op, value });
            }
            if !self.keyword("AND") {
                return Ok(filters);
            }
        }
    }

    /// Accept and ignore a RETURNING clause; affected rows are always
    /// returned.
    fn returning(&mut self) -> DbResult<()> {
        if self.keyword("RETURNING") && !self.punct('*') {
            self.ident_list()?;
        }
        Ok(())
    }
}
