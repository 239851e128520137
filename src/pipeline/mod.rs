//! The question-to-report pipeline.

pub mod context;
pub mod followup;
pub mod freshness;
pub mod generator;
pub mod models;
pub mod orchestrator;
pub mod predefined;
pub mod router;
pub mod schema;
pub mod simplifier;
pub mod validator;

pub use context::{duckdb_orchestrator, ContextRegistry};
pub use models::{QueryRequest, QueryResponse};
pub use orchestrator::{Orchestrator, PipelineComponents, PipelineSettings};
