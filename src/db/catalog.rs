use async_trait::async_trait;
use tracing::debug;

use super::db_pool::DbPool;
use super::{ColumnInfo, SchemaCatalog};
use crate::error::DataStoreError;

/// Catalog backed by DuckDB's `information_schema`.
#[derive(Clone)]
pub struct DuckDbCatalog {
    pool: DbPool,
    schema: String,
    /// Empty means no restriction.
    allowed: Vec<String>,
    /// Internal tables never offered to the pipeline.
    hidden: Vec<String>,
}

impl DuckDbCatalog {
    pub fn new(pool: DbPool, schema: String, allowed: Vec<String>, hidden: Vec<String>) -> Self {
        Self {
            pool,
            schema,
            allowed,
            hidden,
        }
    }

    fn is_visible(&self, table: &str) -> bool {
        let hidden = self.hidden.iter().any(|h| h.eq_ignore_ascii_case(table));
        let allowed =
            self.allowed.is_empty() || self.allowed.iter().any(|a| a.eq_ignore_ascii_case(table));
        allowed && !hidden
    }
}

#[async_trait]
impl SchemaCatalog for DuckDbCatalog {
    async fn list_tables(&self) -> Result<Vec<String>, DataStoreError> {
        let pool = self.pool.clone();
        let schema = self.schema.clone();

        let tables = tokio::task::spawn_blocking(move || -> Result<Vec<String>, DataStoreError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = ? ORDER BY table_name",
            )?;
            let rows = stmt.query_map([&schema], |row| row.get::<_, String>(0))?;
            Ok(rows.filter_map(Result::ok).collect())
        })
        .await??;

        let visible: Vec<String> = tables.into_iter().filter(|t| self.is_visible(t)).collect();
        debug!("Catalog lists {} tables", visible.len());
        Ok(visible)
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DataStoreError> {
        if !self.is_visible(table) {
            return Ok(Vec::new());
        }

        let pool = self.pool.clone();
        let schema = self.schema.clone();
        let table = table.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<ColumnInfo>, DataStoreError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = ? AND lower(table_name) = lower(?) \
                 ORDER BY ordinal_position",
            )?;
            let rows = stmt.query_map([&schema, &table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                })
            })?;
            Ok(rows.filter_map(Result::ok).collect())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::db_pool::build_pool;

    fn catalog(allowed: Vec<&str>) -> DuckDbCatalog {
        let pool = build_pool(":memory:", 2).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE accounts (ACCT_ID INTEGER, OPEN_DT DATE);
                 CREATE TABLE customers (CUST_ID INTEGER, NAME VARCHAR);
                 CREATE TABLE predefined_queries (query_key VARCHAR);",
            )
            .unwrap();
        DuckDbCatalog::new(
            pool,
            "main".to_string(),
            allowed.into_iter().map(String::from).collect(),
            vec!["predefined_queries".to_string()],
        )
    }

    #[tokio::test]
    async fn lists_visible_tables() {
        let all = catalog(vec![]).list_tables().await.unwrap();
        assert_eq!(all, vec!["accounts", "customers"]);

        let restricted = catalog(vec!["CUSTOMERS"]).list_tables().await.unwrap();
        assert_eq!(restricted, vec!["customers"]);
    }

    #[tokio::test]
    async fn columns_are_case_insensitive_and_restricted() {
        let cat = catalog(vec!["accounts"]);
        let cols = cat.columns("ACCOUNTS").await.unwrap();
        assert_eq!(
            cols,
            vec![
                ColumnInfo {
                    name: "ACCT_ID".to_string(),
                    data_type: "INTEGER".to_string()
                },
                ColumnInfo {
                    name: "OPEN_DT".to_string(),
                    data_type: "DATE".to_string()
                },
            ]
        );
        assert!(cat.columns("customers").await.unwrap().is_empty());
    }
}
