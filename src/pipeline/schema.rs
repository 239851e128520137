use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::db::{ColumnInfo, SchemaCatalog};
use crate::error::DataStoreError;

const MAX_SUGGESTIONS: usize = 5;
const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Catalog lookups for the validator and the prompts.
///
/// Column existence answers and the prompt schema text are cached for the life
/// of the instance; the catalog is assumed not to change underneath it.
pub struct SchemaIntrospector {
    catalog: Arc<dyn SchemaCatalog>,
    column_cache: RwLock<HashMap<(String, String), bool>>,
    schema_text: RwLock<Option<String>>,
}

impl SchemaIntrospector {
    pub fn new(catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self {
            catalog,
            column_cache: RwLock::new(HashMap::new()),
            schema_text: RwLock::new(None),
        }
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, DataStoreError> {
        self.catalog.list_tables().await
    }

    /// Catalog spelling of `name`, if the table exists.
    pub async fn resolve_table(&self, name: &str) -> Result<Option<String>, DataStoreError> {
        Ok(self
            .list_tables()
            .await?
            .into_iter()
            .find(|t| t.eq_ignore_ascii_case(name)))
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool, DataStoreError> {
        Ok(self.resolve_table(name).await?.is_some())
    }

    pub async fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, DataStoreError> {
        self.catalog.columns(table).await
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool, DataStoreError> {
        let key = (table.to_lowercase(), column.to_lowercase());
        if let Some(hit) = self.read_cache(&key) {
            return Ok(hit);
        }

        let exists = self
            .columns(table)
            .await?
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column));

        self.column_cache
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, exists);
        Ok(exists)
    }

    fn read_cache(&self, key: &(String, String)) -> Option<bool> {
        self.column_cache
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .copied()
    }

    pub async fn suggest_tables(&self, name: &str) -> Result<Vec<String>, DataStoreError> {
        let tables = self.list_tables().await?;
        Ok(rank_suggestions(name, &tables))
    }

    /// Near matches for a missing column, drawn from the same table only.
    pub async fn suggest_columns(&self, table: &str, column: &str) -> Result<Vec<String>, DataStoreError> {
        let names: Vec<String> = self.columns(table).await?.into_iter().map(|c| c.name).collect();
        Ok(rank_suggestions(column, &names))
    }

    /// Plain-text schema for prompts: one block per table.
    pub async fn schema_text(&self) -> Result<String, DataStoreError> {
        if let Some(text) = self.schema_text.read().unwrap_or_else(|p| p.into_inner()).clone() {
            return Ok(text);
        }

        let mut out = String::new();
        for table in self.list_tables().await? {
            out.push_str(&self.describe_table(&table).await?);
            out.push('\n');
        }
        *self.schema_text.write().unwrap_or_else(|p| p.into_inner()) = Some(out.clone());
        Ok(out)
    }

    pub async fn describe_table(&self, table: &str) -> Result<String, DataStoreError> {
        let columns = self.columns(table).await?;
        let mut out = format!("Table: {}\n", table);
        for col in columns {
            out.push_str(&format!("  - {} ({})\n", col.name, col.data_type));
        }
        Ok(out)
    }
}

fn name_tokens(name: &str) -> HashSet<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

/// Rank `candidates` by likeness to `target`.
///
/// Tiers, best first: substring containment either way, character similarity
/// above [`SIMILARITY_THRESHOLD`], then shared multi-character name tokens.
pub fn rank_suggestions(target: &str, candidates: &[String]) -> Vec<String> {
    let target_lower = target.to_lowercase();
    let target_tokens = name_tokens(target);

    let mut scored: Vec<(f64, &String)> = candidates
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(target))
        .filter_map(|c| {
            let lower = c.to_lowercase();
            let similarity = strsim::jaro_winkler(&target_lower, &lower);

            let score = if lower.contains(&target_lower) || target_lower.contains(&lower) {
                3.0 + similarity
            } else if similarity >= SIMILARITY_THRESHOLD {
                2.0 + similarity
            } else {
                let shared = name_tokens(c).intersection(&target_tokens).count();
                if shared == 0 {
                    return None;
                }
                1.0 + shared as f64 / target_tokens.len().max(1) as f64
            };
            Some((score, c))
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let ranked: Vec<String> = scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, c)| c.clone())
        .collect();
    debug!("Suggestions for '{}': {:?}", target, ranked);
    ranked
}
