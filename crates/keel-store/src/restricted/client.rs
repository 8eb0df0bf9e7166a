//! Structured REST client for the restricted backend.
//!
//! The hosted API exposes one resource per table
//! (`{url}/rest/v1/{table}`) with filters encoded as query parameters
//! (`column=eq.value`).  [`RestClient`] is the seam the adapter talks
//! through; [`HttpRestClient`] is the `reqwest` implementation.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::RestrictedSdkConfig;
use crate::error::{DbError, DbResult};
use crate::traits::Row;

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    IsNull,
    IsNotNull,
}

impl FilterOp {
    fn as_operator(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::IsNull => "is",
            Self::IsNotNull => "not.is",
        }
    }
}

/// One `column <op> value` condition.  Filters are always AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    /// Ignored for the null checks.
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Query-string pair, e.g. `("status", "eq.active")`.
    pub fn query_pair(&self) -> (String, String) {
        let operand = match self.op {
            FilterOp::IsNull | FilterOp::IsNotNull => "null".to_string(),
            _ => literal(&self.value),
        };
        (
            self.column.clone(),
            format!("{}.{operand}", self.op.as_operator()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// A structured read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectRequest {
    pub table: String,
    /// Empty selects every column.
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<u64>,
}

impl SelectRequest {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(",")
        };
        let mut pairs = vec![("select".to_string(), columns)];
        pairs.extend(self.filters.iter().map(Filter::query_pair));
        if let Some(order) = &self.order {
            let direction = if order.descending { "desc" } else { "asc" };
            pairs.push(("order".to_string(), format!("{}.{direction}", order.column)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

/// Structured operations offered by the hosted API.  Every call returns the
/// affected rows.
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn select(&self, request: &SelectRequest) -> DbResult<Vec<Row>>;

    async fn insert(&self, table: &str, rows: &[Row]) -> DbResult<Vec<Row>>;

    async fn update(&self, table: &str, values: &Row, filters: &[Filter]) -> DbResult<Vec<Row>>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> DbResult<Vec<Row>>;
}

/// [`RestClient`] over HTTPS with `apikey` and bearer authentication.
pub struct HttpRestClient {
    base: Url,
    api_key: String,
    http: reqwest::Client,
}

impl HttpRestClient {
    pub fn new(config: &RestrictedSdkConfig) -> DbResult<Self> {
        let base = Url::parse(&config.url).map_err(|e| DbError::Config {
            errors: vec![format!("DATABASE_API_URL is not a valid URL: {e}")],
            guide: String::new(),
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base,
            api_key: config.api_key.clone(),
            http,
        })
    }

    fn table_url(&self, table: &str) -> DbResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| DbError::Http(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(["rest", "v1", table]);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation")
    }

    async fn send(&self, builder: RequestBuilder) -> DbResult<Vec<Row>> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DbError::Http(format!("{status}: {}", body.trim())));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row),
                    other => Err(DbError::Http(format!("expected a row object, got {other}"))),
                })
                .collect(),
            Value::Object(row) => Ok(vec![row]),
            other => Err(DbError::Http(format!("unexpected response body: {other}"))),
        }
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn select(&self, request: &SelectRequest) -> DbResult<Vec<Row>> {
        let mut url = self.table_url(&request.table)?;
        url.query_pairs_mut().extend_pairs(request.query_pairs());
        debug!(table = %request.table, filters = request.filters.len(), "rest select");
        self.send(self.request(Method::GET, url)).await
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> DbResult<Vec<Row>> {
        let url = self.table_url(table)?;
        debug!(table = %table, rows = rows.len(), "rest insert");
        self.send(self.request(Method::POST, url).json(rows)).await
    }

    async fn update(&self, table: &str, values: &Row, filters: &[Filter]) -> DbResult<Vec<Row>> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .extend_pairs(filters.iter().map(Filter::query_pair));
        debug!(table = %table, filters = filters.len(), "rest update");
        self.send(self.request(Method::PATCH, url).json(values)).await
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> DbResult<Vec<Row>> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .extend_pairs(filters.iter().map(Filter::query_pair));
        debug!(table = %table, filters = filters.len(), "rest delete");
        self.send(self.request(Method::DELETE, url)).await
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn select_encodes_filters_order_and_limit() {
        let request = SelectRequest {
            table: "migrations".into(),
            columns: vec!["id".into(), "checksum".into()],
            filters: vec![
                Filter::eq("status", "active"),
                Filter {
                    column: "deleted_at".into(),
                    op: FilterOp::IsNull,
                    value: Value::Null,
                },
            ],
            order: Some(Order {
                column: "id".into(),
                descending: true,
            }),
            limit: Some(5),
        };
        let pairs = request.query_pairs();
        assert_eq!(pairs[0], ("select".into(), "id,checksum".into()));
        assert_eq!(pairs[1], ("status".into(), "eq.active".into()));
        assert_eq!(pairs[2], ("deleted_at".into(), "is.null".into()));
        assert_eq!(pairs[3], ("order".into(), "id.desc".into()));
        assert_eq!(pairs[4], ("limit".into(), "5".into()));
    }

    #[test]
    fn table_urls_append_to_the_base_path() {
        let client = HttpRestClient::new(&RestrictedSdkConfig {
            url: "https://abc.supabase.co".into(),
            api_key: "key".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(
            client.table_url("documents").unwrap().as_str(),
            "https://abc.supabase.co/rest/v1/documents"
        );
    }
}
