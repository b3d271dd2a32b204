//! Access to the relational store the engine exports from and imports into.
//!
//! The engine needs four primitives: filtered selects, inserts that assign a
//! fresh id, field updates by id, and delete-by-id for compensation. Rows are
//! opaque JSON objects keyed by logical table name.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::bundle::Record;
use crate::AppError;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn within<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, row: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => row.get(field) == Some(value),
            Filter::In(field, values) => row.get(field).map_or(false, |v| values.contains(v)),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{table}: {message}")]
    Rejected { table: String, message: String },
    #[error("{table}: row {id} not found")]
    NotFound { table: String, id: String },
    #[error("invalid row in {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Rejected { .. } => "REJECTED",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Decode { .. } => "DECODE",
            StoreError::Database(_) => "DATABASE",
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            StoreError::Rejected { table, .. }
            | StoreError::NotFound { table, .. }
            | StoreError::Decode { table, .. } => Some(table),
            StoreError::Database(_) => None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let mut app = AppError::new(format!("STORE/{}", err.code()), err.to_string());
        if let Some(table) = err.table() {
            app = app.with_context("table", table.to_string());
        }
        app
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter) -> StoreResult<Vec<Record>>;

    /// Inserts `row` under a newly generated id and returns that id. Any `id`
    /// carried by `row` is replaced.
    async fn insert(&self, table: &str, row: Record) -> StoreResult<String>;

    /// Overwrites the given fields of row `id`; other fields are kept.
    async fn update(&self, table: &str, id: &str, changes: Record) -> StoreResult<()>;

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()>;

    async fn select_one(&self, table: &str, filter: &Filter) -> StoreResult<Option<Record>> {
        Ok(self.select(table, filter).await?.into_iter().next())
    }
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
