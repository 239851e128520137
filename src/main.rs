use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use nl_report::config::{AppConfig, CliArgs};
use nl_report::db::db_pool::build_pool;
use nl_report::knowledge::{JsonKnowledgeBase, KnowledgeRetriever};
use nl_report::llm::LlmManager;
use nl_report::util::logging::init_tracing;
use nl_report::web::{self, state::AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration; tracing is not up yet, so report straight to stderr
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_tracing(config.logging.format);

    info!("Opening DuckDB at {}", config.database.connection_string);
    let pool = build_pool(&config.database.connection_string, config.database.pool_size as u32)?;

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = match LlmManager::new(&config.llm) {
        Ok(manager) => manager,
        Err(e) => {
            // keep serving predefined queries without generation
            warn!("LLM backend unavailable: {}", e);
            LlmManager::unavailable(e.to_string())
        }
    };

    let knowledge: Arc<dyn KnowledgeRetriever> = match &config.knowledge.path {
        Some(path) => Arc::new(JsonKnowledgeBase::load(path)?),
        None => Arc::new(JsonKnowledgeBase::default()),
    };

    let web_config = config.web.clone();
    let app_state = Arc::new(AppState::new(config, pool, llm_manager, knowledge));

    // Warm the pipeline so schema problems show up at startup
    match app_state.orchestrator().schema().list_tables().await {
        Ok(tables) => info!("{} tables visible to the pipeline", tables.len()),
        Err(e) => error!("Failed to read the catalog: {}", e),
    }

    info!("Starting nl-report server on {}:{}", web_config.host, web_config.port);
    if let Err(e) = web::run_server(web_config, app_state).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    info!("Server stopped gracefully");

    Ok(())
}
