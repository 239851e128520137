pub mod catalog;
pub mod db_pool;
pub mod executor;
pub mod registry;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::DataStoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// Rows of a finished query, columns in select order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
}

/// Read-only view of the tables a question may touch.
#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>, DataStoreError>;

    /// Columns of `table`; empty when the table is unknown.
    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DataStoreError>;
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult, DataStoreError>;

    /// `MAX(column)` rendered as text, `None` for an empty or all-null column.
    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>, DataStoreError>;
}

/// Double-quote an identifier for DuckDB.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
