use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{error, info};

use super::db_pool::DbPool;
use super::{quote_ident, ExecutionResult, QueryExecutor};
use crate::error::DataStoreError;

/// Runs read-only statements through the pool, collecting results via Arrow.
#[derive(Clone)]
pub struct DuckDbExecutor {
    pool: DbPool,
    max_rows: usize,
}

impl DuckDbExecutor {
    pub fn new(pool: DbPool, max_rows: usize) -> Self {
        Self { pool, max_rows }
    }
}

#[async_trait]
impl QueryExecutor for DuckDbExecutor {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult, DataStoreError> {
        let pool = self.pool.clone();
        let sql = sql.to_string();
        let max_rows = self.max_rows;

        let result = tokio::task::spawn_blocking(move || -> Result<ExecutionResult, DataStoreError> {
            let start_time = Instant::now();
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql).inspect_err(|e| {
                error!("Failed to prepare query: {}", e);
            })?;

            // Get result as an Arrow batch
            let arrow_batch = stmt.query_arrow([]).inspect_err(|e| {
                error!("Failed to execute query: {}", e);
            })?;
            let schema = arrow_batch.get_schema();

            let columns = schema
                .fields()
                .iter()
                .map(|field| field.name().clone())
                .collect::<Vec<String>>();

            let mut batches: Vec<RecordBatch> = Vec::new();
            let mut taken = 0usize;
            for batch in arrow_batch {
                if taken >= max_rows {
                    break;
                }
                let keep = batch.num_rows().min(max_rows - taken);
                taken += keep;
                batches.push(if keep < batch.num_rows() {
                    batch.slice(0, keep)
                } else {
                    batch
                });
            }

            let rows = batches_to_rows(&batches, &columns)?;
            info!(
                "Query executed successfully. Row count: {}, Execution time: {}ms",
                rows.len(),
                start_time.elapsed().as_millis()
            );

            Ok(ExecutionResult {
                row_count: rows.len(),
                columns,
                rows,
            })
        })
        .await??;

        Ok(result)
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>, DataStoreError> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT CAST(MAX({}) AS VARCHAR) FROM {}",
            quote_ident(column),
            quote_ident(table)
        );

        tokio::task::spawn_blocking(move || -> Result<Option<String>, DataStoreError> {
            let conn = pool.get()?;
            let value: Option<String> = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(value)
        })
        .await?
    }
}

/// Arrow batches to JSON objects; nulls the writer omits come back as explicit nulls.
fn batches_to_rows(
    batches: &[RecordBatch],
    columns: &[String],
) -> Result<Vec<Map<String, Value>>, DataStoreError> {
    let mut writer = arrow::json::ArrayWriter::new(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;
    let buffer = writer.into_inner();

    if buffer.is_empty() {
        return Ok(Vec::new());
    }

    let mut rows: Vec<Map<String, Value>> = serde_json::from_slice(&buffer)
        .map_err(|e| DataStoreError::Encoding(e.to_string()))?;
    for row in rows.iter_mut() {
        for col in columns {
            row.entry(col.clone()).or_insert(Value::Null);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::db_pool::build_pool;

    fn executor(max_rows: usize) -> DuckDbExecutor {
        let pool = build_pool(":memory:", 2).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE accounts (ACCT_ID INTEGER, STATUS VARCHAR, OPEN_DT DATE);
                 INSERT INTO accounts VALUES
                    (1, 'OPEN', DATE '2024-01-05'),
                    (2, NULL, DATE '2024-03-10'),
                    (3, 'CLOSED', NULL);",
            )
            .unwrap();
        DuckDbExecutor::new(pool, max_rows)
    }

    #[tokio::test]
    async fn returns_columns_in_select_order() {
        let result = executor(100)
            .execute("SELECT STATUS, ACCT_ID FROM accounts ORDER BY ACCT_ID")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["STATUS", "ACCT_ID"]);
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows[0]["ACCT_ID"], Value::from(1));
        assert_eq!(result.rows[1]["STATUS"], Value::Null);
    }

    #[tokio::test]
    async fn caps_rows() {
        let result = executor(2).execute("SELECT * FROM accounts").await.unwrap();
        assert_eq!(result.row_count, 2);
    }

    #[tokio::test]
    async fn surfaces_binder_errors() {
        let err = executor(10)
            .execute("SELECT NOPE FROM accounts")
            .await
            .unwrap_err();
        assert_eq!(
            crate::error::classify_execution_error(&err.to_string()),
            crate::error::ErrorKind::InvalidColumn
        );
    }

    #[tokio::test]
    async fn max_value_as_text() {
        let exec = executor(10);
        assert_eq!(
            exec.max_value("accounts", "OPEN_DT").await.unwrap().as_deref(),
            Some("2024-03-10")
        );
        assert_eq!(exec.max_value("accounts", "ACCT_ID").await.unwrap().as_deref(), Some("3"));
    }
}
