use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use super::orchestrator::{Orchestrator, PipelineComponents, PipelineSettings};
use crate::config::AppConfig;
use crate::db::catalog::DuckDbCatalog;
use crate::db::db_pool::DbPool;
use crate::db::executor::DuckDbExecutor;
use crate::db::registry::DuckDbRegistry;
use crate::knowledge::KnowledgeRetriever;
use crate::llm::LlmManager;

/// Wire a pipeline over a DuckDB pool.
pub fn duckdb_orchestrator(
    config: &AppConfig,
    pool: DbPool,
    llm: LlmManager,
    knowledge: Arc<dyn KnowledgeRetriever>,
) -> Orchestrator {
    let hidden = vec![config.database.predefined_table.clone()];
    let components = PipelineComponents {
        catalog: Arc::new(DuckDbCatalog::new(
            pool.clone(),
            config.database.schema.clone(),
            config.pipeline.allowed_table_list(),
            hidden,
        )),
        executor: Arc::new(DuckDbExecutor::new(pool.clone(), config.database.max_result_rows)),
        registry: Arc::new(DuckDbRegistry::new(pool, config.database.predefined_table.clone())),
        knowledge,
        llm,
    };
    Orchestrator::new(components, PipelineSettings::from_config(config))
}

/// One pipeline per data-store connection string.
///
/// Two callers racing on first use may both build a pipeline; the first one
/// stored wins and the other is dropped.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: RwLock<HashMap<String, Arc<Orchestrator>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Orchestrator>> {
        self.contexts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    pub fn get_or_init<E>(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<Orchestrator, E>,
    ) -> Result<Arc<Orchestrator>, E> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        // built outside the lock; construction may touch the database
        let built = Arc::new(build()?);
        let mut contexts = self.contexts.write().unwrap_or_else(|p| p.into_inner());
        let entry = contexts.entry(key.to_string()).or_insert_with(|| {
            info!("Pipeline context created for {}", key);
            built
        });
        Ok(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
