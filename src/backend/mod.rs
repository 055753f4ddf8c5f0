//! Facade over the hosted data service: filtered reads, row writes, per-table
//! change feeds and blob uploads. Rows are loose JSON objects; the
//! normalization layer turns them into typed models.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub type Row = Map<String, Value>;

pub const ORDERS_TABLE: &str = "orders";
pub const DRIVERS_TABLE: &str = "drivers";
pub const SETTINGS_TABLE: &str = "settings";
pub const SIGNATURES_BUCKET: &str = "signatures";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("row rejected: {0}")]
    Rejected(String),

    #[error("storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Eq(Value),
    In(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub op: Op,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub predicates: Vec<Predicate>,
    /// Groups of which at least one predicate must hold, like an `or(...)`.
    pub alternatives: Vec<Vec<Predicate>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op: Op::Eq(value.into()),
        });
        self
    }

    /// Matches rows where any of `columns` equals `value`.
    pub fn eq_any(mut self, columns: &[&str], value: impl Into<Value>) -> Self {
        let value = value.into();
        self.alternatives.push(
            columns
                .iter()
                .map(|column| Predicate {
                    column: column.to_string(),
                    op: Op::Eq(value.clone()),
                })
                .collect(),
        );
        self
    }

    pub fn one_of(mut self, column: &str, values: Vec<Value>) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op: Op::In(values),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filter: Filter,
    pub order_by: Option<(String, bool)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filter: Filter::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order_by = Some((column.to_string(), true));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

/// Change feed for one table. Dropping it unsubscribes.
pub struct Subscription {
    table: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(table: &str, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            table: table.to_string(),
            rx,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Next event for this table, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.table == self.table => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(table = %self.table, skipped, "change feed lagged; events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, query: Query) -> Result<Vec<Row>, BackendError>;

    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError>;

    /// Partial update; returns the affected rows after the write.
    async fn update(&self, table: &str, filter: Filter, patch: Row) -> Result<Vec<Row>, BackendError>;

    async fn delete(&self, table: &str, filter: Filter) -> Result<Vec<Row>, BackendError>;

    fn subscribe(&self, table: &str) -> Subscription;

    /// Stores a blob and returns its path inside the bucket.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        upsert: bool,
    ) -> Result<String, BackendError>;
}

/// Builds a row from `(column, value)` pairs.
pub fn row<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
