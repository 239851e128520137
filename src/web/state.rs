use std::convert::Infallible;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::db_pool::DbPool;
use crate::knowledge::KnowledgeRetriever;
use crate::llm::LlmManager;
use crate::pipeline::context::{duckdb_orchestrator, ContextRegistry};
use crate::pipeline::orchestrator::Orchestrator;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub llm_manager: LlmManager,
    pub knowledge: Arc<dyn KnowledgeRetriever>,
    pub contexts: ContextRegistry,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db_pool: DbPool,
        llm_manager: LlmManager,
        knowledge: Arc<dyn KnowledgeRetriever>,
    ) -> Self {
        Self {
            config,
            db_pool,
            llm_manager,
            knowledge,
            contexts: ContextRegistry::new(),
            startup_time: chrono::Utc::now(),
        }
    }

    /// Pipeline for the configured database, created on first use.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        let built = self
            .contexts
            .get_or_init(&self.config.database.connection_string, || {
                Ok::<_, Infallible>(duckdb_orchestrator(
                    &self.config,
                    self.db_pool.clone(),
                    self.llm_manager.clone(),
                    self.knowledge.clone(),
                ))
            });
        match built {
            Ok(orchestrator) => orchestrator,
            Err(never) => match never {},
        }
    }
}
