use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::followup::FollowUpGate;
use super::freshness::FreshnessAnalyzer;
use super::generator::SqlGenerator;
use super::models::{AgentUsed, Mode, QueryRequest, QueryResponse, Route, ValidationErrorKind};
use super::predefined::PredefinedMatcher;
use super::router::QuestionRouter;
use super::schema::SchemaIntrospector;
use super::simplifier::try_simplify;
use super::validator::SchemaValidator;
use crate::config::{AppConfig, SqlDialect};
use crate::conversation::{ConversationalResponder, LlmConversationalResponder};
use crate::db::registry::PredefinedRegistry;
use crate::db::{QueryExecutor, SchemaCatalog};
use crate::error::{classify_execution_error, PipelineError};
use crate::knowledge::KnowledgeRetriever;
use crate::llm::LlmManager;
use crate::sql::{structural_check, StructuralIssue};

pub const UNSAFE_SQL_ANSWER: &str =
    "Generated SQL query contains unsafe operations and was blocked for security.";
pub const UNSAFE_SQL_ERROR: &str = "Unsafe SQL query detected";
pub const INVALID_SQL_ANSWER: &str = "I couldn't generate a valid SQL query for this question.";
const GENERATION_UNAVAILABLE_ANSWER: &str =
    "I can't generate SQL right now. Please try again later or use a predefined query.";
const EXECUTION_FAILED_ANSWER: &str = "I couldn't complete this report because the query failed.";
const SIMPLIFIED_NOTE: &str = " No rows matched the joined query, so these results come from the primary table only.";

/// External capabilities the pipeline runs against.
pub struct PipelineComponents {
    pub catalog: Arc<dyn SchemaCatalog>,
    pub executor: Arc<dyn QueryExecutor>,
    pub registry: Arc<dyn PredefinedRegistry>,
    pub knowledge: Arc<dyn KnowledgeRetriever>,
    pub llm: LlmManager,
}

/// Tunables taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dialect: SqlDialect,
    pub freshness_threshold_days: i64,
    pub audit_columns: Vec<String>,
    pub max_generation_attempts: u8,
    pub max_correction_attempts: u32,
    pub knowledge_results: usize,
    pub support_message: String,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dialect: config.database.dialect,
            freshness_threshold_days: config.pipeline.freshness_threshold_days,
            audit_columns: config.pipeline.audit_columns.clone(),
            max_generation_attempts: config.pipeline.max_generation_attempts.min(u8::MAX as u32) as u8,
            max_correction_attempts: config.pipeline.max_correction_attempts,
            knowledge_results: config.knowledge.max_results,
            support_message: config.support.contact_message(),
        }
    }
}

/// Drives one question from routing to a finished response.
pub struct Orchestrator {
    router: QuestionRouter,
    matcher: PredefinedMatcher,
    generator: SqlGenerator,
    validator: SchemaValidator,
    followup: FollowUpGate,
    responder: Arc<dyn ConversationalResponder>,
    executor: Arc<dyn QueryExecutor>,
    schema: Arc<SchemaIntrospector>,
    settings: PipelineSettings,
    today: Option<NaiveDate>,
}

impl Orchestrator {
    pub fn new(components: PipelineComponents, settings: PipelineSettings) -> Self {
        let PipelineComponents {
            catalog,
            executor,
            registry,
            knowledge,
            llm,
        } = components;

        let schema = Arc::new(SchemaIntrospector::new(catalog));
        let freshness = Arc::new(FreshnessAnalyzer::new(
            schema.clone(),
            executor.clone(),
            settings.audit_columns.clone(),
        ));
        let matcher = PredefinedMatcher::new(registry);

        Self {
            router: QuestionRouter::new(matcher.clone(), llm.clone()),
            generator: SqlGenerator::new(
                schema.clone(),
                knowledge.clone(),
                llm.clone(),
                settings.dialect,
                settings.max_generation_attempts,
                settings.knowledge_results,
            ),
            validator: SchemaValidator::new(
                schema.clone(),
                executor.clone(),
                llm.clone(),
                knowledge.clone(),
                settings.dialect,
                settings.knowledge_results,
            ),
            followup: FollowUpGate::new(
                schema.clone(),
                freshness.clone(),
                llm.clone(),
                settings.freshness_threshold_days,
            ),
            responder: Arc::new(LlmConversationalResponder::new(
                llm,
                schema.clone(),
                freshness,
                knowledge,
                settings.knowledge_results,
            )),
            matcher,
            executor,
            schema,
            settings,
            today: None,
        }
    }

    /// Pin the date used for freshness; tests only.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn schema(&self) -> &Arc<SchemaIntrospector> {
        &self.schema
    }

    pub fn matcher(&self) -> &PredefinedMatcher {
        &self.matcher
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Never fails: anything unexpected becomes a generic error response.
    pub async fn handle(&self, request: QueryRequest) -> QueryResponse {
        match self.run(request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Unexpected pipeline failure: {}", e);
                QueryResponse::unexpected(&e)
            }
        }
    }

    async fn run(&self, mut request: QueryRequest) -> Result<QueryResponse, PipelineError> {
        let today = self.today();

        if let Some(answers) = request.followup_answers.take().filter(|a| !a.is_empty()) {
            if answers.values().any(|v| v.trim().eq_ignore_ascii_case("no")) {
                info!("User declined a follow-up question; nothing executed");
                return Ok(QueryResponse::cancelled());
            }
            let folded = answers
                .iter()
                .map(|(id, value)| format!("{}={}", id, value))
                .collect::<Vec<_>>()
                .join(", ");
            request.question = format!("{}\n\nFollow-up answers: {}", request.question, folded);
            request.skip_followups = true;
        }

        let previous = request
            .previous_sql_query
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        if request.mode == Mode::Conversation {
            let answer = self.responder.respond(&request.question, previous, today).await;
            return Ok(QueryResponse::conversational(
                answer,
                Some("conversation_mode".to_string()),
            ));
        }

        let decision = self
            .router
            .decide(
                &request.question,
                request.query_key.as_deref(),
                request.use_predefined,
                previous,
            )
            .await?;
        let reason = Some(decision.reason.clone());

        let response = match decision.route {
            Route::Predefined => {
                let key = decision.predefined_key.unwrap_or_default();
                self.run_predefined(&key).await?
            }
            Route::Conversational => {
                let answer = self.responder.respond(&request.question, previous, today).await;
                QueryResponse::conversational(answer, None)
            }
            Route::ReportSql => {
                self.run_report(&request.question, previous, request.skip_followups, today)
                    .await?
            }
        };
        Ok(response.with_route_reason(reason))
    }

    async fn run_predefined(&self, key: &str) -> Result<QueryResponse, PipelineError> {
        let Some(entry) = self.matcher.get(key).await? else {
            return Ok(QueryResponse::failure(
                "Predefined query not found.",
                format!("No active predefined query with key '{}'", key),
                None,
                AgentUsed::Predefined,
            ));
        };

        info!("Executing predefined query '{}'", key);
        let mut response = match self.executor.execute(&entry.sql).await {
            Ok(result) => QueryResponse::rows(entry.sql, result, AgentUsed::Predefined),
            Err(e) => {
                error!("Predefined query '{}' failed: {}", key, e);
                QueryResponse::failure(
                    "Error executing predefined query.",
                    e.to_string(),
                    Some(entry.sql),
                    AgentUsed::Predefined,
                )
            }
        };
        response.is_predefined = true;
        response.question_key = Some(entry.key);
        Ok(response)
    }

    async fn run_report(
        &self,
        question: &str,
        previous: Option<&str>,
        skip_followups: bool,
        today: NaiveDate,
    ) -> Result<QueryResponse, PipelineError> {
        let (mut sql, mut agent) = match self.generator.generate(question, previous).await {
            Ok(candidate) => {
                let agent = if candidate.attempt <= 1 {
                    AgentUsed::SqlMaker
                } else {
                    AgentUsed::SqlMakerRepair
                };
                (candidate.cleaned, agent)
            }
            Err(PipelineError::InvalidCandidateStructure(reason)) => {
                warn!("Generator gave up ({}); trying the fallback generator", reason);
                match self.generator.fallback(question, &reason).await {
                    Ok(candidate) => (candidate.cleaned, AgentUsed::MultiAgent),
                    Err(e) => return Ok(generation_failure(e, AgentUsed::MultiAgent)),
                }
            }
            Err(e @ PipelineError::GenerationUnavailable(_)) => {
                return Ok(generation_failure(e, AgentUsed::SqlMaker));
            }
            Err(e) => return Err(e),
        };

        if let Err(issue) = structural_check(&sql) {
            warn!("Blocked candidate SQL: {}", issue);
            return Ok(match issue {
                StructuralIssue::DangerousOperation => {
                    QueryResponse::failure(UNSAFE_SQL_ANSWER, UNSAFE_SQL_ERROR, Some(sql), agent)
                }
                _ => QueryResponse::failure(INVALID_SQL_ANSWER, issue.to_string(), Some(sql), agent),
            });
        }

        if !skip_followups {
            let assessment = self.followup.assess(question, &sql, today).await?;
            if assessment.needs_followup {
                return Ok(QueryResponse::clarification(
                    sql,
                    assessment.questions,
                    assessment.analysis,
                ));
            }
        }

        let mut result = match self.executor.execute(&sql).await {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                error!("Query execution failed: {}", message);
                if self.settings.max_correction_attempts == 0 {
                    return Ok(self.store_failure(sql, message, agent));
                }

                let outcome = self
                    .validator
                    .validate_and_correct(question, &sql, Some(&message))
                    .await?;
                if outcome.error_kind.is_some_and(|k| k.is_structural()) {
                    let detail = outcome.error.unwrap_or(message);
                    return Ok(self.execution_failure(sql, detail, outcome.error_kind, agent));
                }
                if outcome.corrected_sql == sql {
                    // no usable correction came back
                    return Ok(self.store_failure(sql, message, agent));
                }
                if !outcome.valid {
                    warn!(
                        "Corrected SQL still looks invalid ({}); executing it anyway",
                        outcome.error.as_deref().unwrap_or("unknown")
                    );
                }

                info!("Using corrected SQL");
                sql = outcome.corrected_sql;
                agent = agent.corrected();
                match self.executor.execute(&sql).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Corrected query failed: {}", e);
                        return Ok(self.store_failure(sql, e.to_string(), agent));
                    }
                }
            }
        };

        let mut simplified = false;
        if result.row_count == 0 {
            let rewrite = try_simplify(&sql, &self.schema, self.executor.as_ref()).await;
            if let Some((new_sql, new_result)) = rewrite {
                sql = new_sql;
                result = new_result;
                simplified = true;
            }
        }

        let mut response = QueryResponse::rows(sql, result, agent);
        if simplified {
            response.answer.push_str(SIMPLIFIED_NOTE);
        }
        Ok(response)
    }

    fn store_failure(&self, sql: String, message: String, agent: AgentUsed) -> QueryResponse {
        let kind = classify_execution_error(&message).into();
        self.execution_failure(sql, message, Some(kind), agent)
    }

    fn execution_failure(
        &self,
        sql: String,
        detail: String,
        kind: Option<ValidationErrorKind>,
        agent: AgentUsed,
    ) -> QueryResponse {
        let mut error = detail;
        if kind.is_some_and(|k| k.is_schema_related()) {
            error.push_str(&self.settings.support_message);
        }
        QueryResponse::failure(EXECUTION_FAILED_ANSWER, error, Some(sql), agent)
    }
}

fn generation_failure(e: PipelineError, agent: AgentUsed) -> QueryResponse {
    let answer = match &e {
        PipelineError::GenerationUnavailable(_) => GENERATION_UNAVAILABLE_ANSWER,
        _ => INVALID_SQL_ANSWER,
    };
    QueryResponse::failure(answer, e.to_string(), None, agent)
}
