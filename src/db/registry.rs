use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::db_pool::DbPool;
use super::quote_ident;
use crate::error::DataStoreError;

/// A curated question with hand-written SQL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedQuery {
    pub key: String,
    pub question: String,
    pub sql: String,
    pub description: String,
    pub active: bool,
}

#[async_trait]
pub trait PredefinedRegistry: Send + Sync {
    async fn active(&self) -> Result<Vec<PredefinedQuery>, DataStoreError>;

    async fn get(&self, key: &str) -> Result<Option<PredefinedQuery>, DataStoreError> {
        Ok(self.active().await?.into_iter().find(|q| q.key == key))
    }
}

/// Registry stored in a DuckDB table:
/// `(query_key, question, sql_query, description, is_active)`.
#[derive(Clone)]
pub struct DuckDbRegistry {
    pool: DbPool,
    table: String,
}

impl DuckDbRegistry {
    pub fn new(pool: DbPool, table: String) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl PredefinedRegistry for DuckDbRegistry {
    async fn active(&self) -> Result<Vec<PredefinedQuery>, DataStoreError> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT query_key, question, sql_query, COALESCE(description, '') \
             FROM {} WHERE is_active ORDER BY query_key",
            quote_ident(&self.table)
        );
        let table = self.table.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<PredefinedQuery>, DataStoreError> {
            let conn = pool.get()?;
            let mut stmt = match conn.prepare(&sql) {
                Ok(stmt) => stmt,
                Err(e) => {
                    // a fresh database simply has no curated queries yet
                    warn!("Predefined query table '{}' unavailable: {}", table, e);
                    return Ok(Vec::new());
                }
            };
            let rows = stmt.query_map([], |row| {
                Ok(PredefinedQuery {
                    key: row.get(0)?,
                    question: row.get(1)?,
                    sql: row.get(2)?,
                    description: row.get(3)?,
                    active: true,
                })
            })?;
            Ok(rows.filter_map(Result::ok).collect())
        })
        .await?
    }
}

/// Fixed registry, used for tests and for running without a registry table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    entries: Vec<PredefinedQuery>,
}

impl InMemoryRegistry {
    pub fn new(entries: Vec<PredefinedQuery>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl PredefinedRegistry for InMemoryRegistry {
    async fn active(&self) -> Result<Vec<PredefinedQuery>, DataStoreError> {
        Ok(self.entries.iter().filter(|q| q.active).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::db_pool::build_pool;

    #[tokio::test]
    async fn reads_only_active_rows() {
        let pool = build_pool(":memory:", 1).unwrap();
        pool.get()
            .unwrap()
            .execute_batch(
                "CREATE TABLE predefined_queries (
                    query_key VARCHAR, question VARCHAR, sql_query VARCHAR,
                    description VARCHAR, is_active BOOLEAN);
                 INSERT INTO predefined_queries VALUES
                    ('open_accounts', 'list open accounts', 'SELECT * FROM accounts', NULL, TRUE),
                    ('retired', 'old report', 'SELECT 1', 'gone', FALSE);",
            )
            .unwrap();

        let registry = DuckDbRegistry::new(pool, "predefined_queries".to_string());
        let active = registry.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "open_accounts");
        assert_eq!(active[0].description, "");
        assert!(registry.get("retired").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_table_means_empty_registry() {
        let pool = build_pool(":memory:", 1).unwrap();
        let registry = DuckDbRegistry::new(pool, "predefined_queries".to_string());
        assert!(registry.active().await.unwrap().is_empty());
    }
}
