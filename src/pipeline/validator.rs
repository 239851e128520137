use std::sync::Arc;
use tracing::{info, warn};

use super::models::{CorrectionOutcome, ValidationErrorKind, ValidationOutcome};
use super::schema::{rank_suggestions, SchemaIntrospector};
use crate::config::SqlDialect;
use crate::db::QueryExecutor;
use crate::error::{classify_execution_error, DataStoreError};
use crate::knowledge::{format_passages, KnowledgeRetriever};
use crate::llm::{LlmManager, Prompt};
use crate::sql::{dry_run_sql, extract_references, extract_sql, structural_check};

/// Tables whose columns are shown when the failing table does not exist.
const SIMILAR_TABLES_IN_PROMPT: usize = 3;

const CORRECTION_SYSTEM_PROMPT: &str = "You fix SQL queries that failed against a reporting database.
Rules:
- Use ONLY tables from the table list and ONLY columns listed for those tables.
- Never invent table or column names. If a name is wrong, pick the closest real one.
- Keep the intent of the original question and query.
- The query must be a single read-only SELECT statement.
- Return only the corrected SQL, with no explanation.";

/// Schema-driven checks plus a single LLM-assisted repair.
pub struct SchemaValidator {
    schema: Arc<SchemaIntrospector>,
    executor: Arc<dyn QueryExecutor>,
    llm: LlmManager,
    knowledge: Arc<dyn KnowledgeRetriever>,
    dialect: SqlDialect,
    knowledge_results: usize,
}

impl SchemaValidator {
    pub fn new(
        schema: Arc<SchemaIntrospector>,
        executor: Arc<dyn QueryExecutor>,
        llm: LlmManager,
        knowledge: Arc<dyn KnowledgeRetriever>,
        dialect: SqlDialect,
        knowledge_results: usize,
    ) -> Self {
        Self {
            schema,
            executor,
            llm,
            knowledge,
            dialect,
            knowledge_results,
        }
    }

    /// STRUCTURAL_CHECK, then SCHEMA_CHECK, then DRY_RUN.
    pub async fn validate(&self, sql: &str) -> Result<ValidationOutcome, DataStoreError> {
        if let Err(issue) = structural_check(sql) {
            return Ok(ValidationOutcome::failed(issue.into(), issue.to_string()));
        }
        self.validate_schema_and_dry_run(sql).await
    }

    async fn validate_schema_and_dry_run(&self, sql: &str) -> Result<ValidationOutcome, DataStoreError> {
        let outcome = self.schema_check(sql).await?;
        if !outcome.valid {
            return Ok(outcome);
        }
        Ok(self.dry_run(sql).await)
    }

    /// Every referenced table and column must exist in the catalog.
    pub async fn schema_check(&self, sql: &str) -> Result<ValidationOutcome, DataStoreError> {
        let refs = extract_references(sql);

        for table in refs.table_names() {
            if !self.schema.table_exists(&table).await? {
                let suggestions = self.schema.suggest_tables(&table).await?;
                let mut detail = format!("Table '{}' does not exist.", table);
                if !suggestions.is_empty() {
                    detail.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
                }
                return Ok(ValidationOutcome::failed(ValidationErrorKind::InvalidTable, detail)
                    .with_suggestions(suggestions));
            }
        }

        for column in &refs.columns {
            match &column.qualifier {
                Some(qualifier) => {
                    if refs.is_derived(qualifier) {
                        continue;
                    }
                    let Some(table) = refs.resolve(qualifier) else {
                        continue;
                    };
                    if !self.schema.column_exists(&table.name, &column.column).await? {
                        return self.missing_column(&table.name, &column.column).await;
                    }
                }
                None => {
                    // unqualified names may come from a derived table we cannot see into
                    if !refs.derived.is_empty() || refs.tables.is_empty() {
                        continue;
                    }
                    let mut found = false;
                    for table in refs.table_names() {
                        if self.schema.column_exists(&table, &column.column).await? {
                            found = true;
                            break;
                        }
                    }
                    if !found {
                        let first = refs.tables[0].name.clone();
                        return self.missing_column(&first, &column.column).await;
                    }
                }
            }
        }

        Ok(ValidationOutcome::ok())
    }

    async fn missing_column(&self, table: &str, column: &str) -> Result<ValidationOutcome, DataStoreError> {
        let suggestions = self.schema.suggest_columns(table, column).await?;
        let mut detail = format!("Invalid column name '{}' in table '{}'.", column, table);
        if !suggestions.is_empty() {
            detail.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
        }
        Ok(ValidationOutcome::failed(ValidationErrorKind::InvalidColumn, detail).with_suggestions(suggestions))
    }

    /// Run the zero-row variant so the engine binds every name.
    pub async fn dry_run(&self, sql: &str) -> ValidationOutcome {
        let zero_rows = dry_run_sql(sql, self.dialect);
        match self.executor.execute(&zero_rows).await {
            Ok(_) => ValidationOutcome::ok(),
            Err(e) => {
                let message = e.to_string();
                let kind = classify_execution_error(&message);
                ValidationOutcome::failed(kind.into(), message)
            }
        }
    }

    /// Validate `sql` and, on a schema or execution failure, attempt exactly one
    /// correction. `known_error` is the data store's message when the query
    /// already failed to execute; validation is then skipped.
    pub async fn validate_and_correct(
        &self,
        question: &str,
        sql: &str,
        known_error: Option<&str>,
    ) -> Result<CorrectionOutcome, DataStoreError> {
        let (kind, detail) = match known_error {
            Some(message) => (
                ValidationErrorKind::from(classify_execution_error(message)),
                message.to_string(),
            ),
            None => {
                let outcome = self.validate(sql).await?;
                if outcome.valid {
                    return Ok(CorrectionOutcome {
                        valid: true,
                        corrected_sql: sql.to_string(),
                        error: None,
                        error_kind: None,
                        attempts: 0,
                    });
                }
                let kind = outcome.error_kind.unwrap_or(ValidationErrorKind::Other);
                let detail = outcome.detail.unwrap_or_default();
                if kind.is_structural() {
                    // no repair for unsafe or malformed text
                    return Ok(CorrectionOutcome {
                        valid: false,
                        corrected_sql: sql.to_string(),
                        error: Some(detail),
                        error_kind: Some(kind),
                        attempts: 0,
                    });
                }
                (kind, detail)
            }
        };

        info!("Correcting SQL after {:?}: {}", kind, detail);
        let prompt = self.correction_prompt(question, sql, kind, &detail).await?;

        let raw = match self.llm.complete(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Correction unavailable: {}", e);
                return Ok(CorrectionOutcome {
                    valid: false,
                    corrected_sql: sql.to_string(),
                    error: Some(detail),
                    error_kind: Some(kind),
                    attempts: 1,
                });
            }
        };

        let corrected = extract_sql(&raw);
        if let Err(issue) = structural_check(&corrected) {
            return Ok(CorrectionOutcome {
                valid: false,
                corrected_sql: corrected,
                error: Some(format!("Correction rejected: {}", issue)),
                error_kind: Some(issue.into()),
                attempts: 1,
            });
        }

        let outcome = self.validate_schema_and_dry_run(&corrected).await?;
        Ok(CorrectionOutcome {
            valid: outcome.valid,
            corrected_sql: corrected,
            error: outcome.detail,
            error_kind: outcome.error_kind,
            attempts: 1,
        })
    }

    async fn correction_prompt(
        &self,
        question: &str,
        sql: &str,
        kind: ValidationErrorKind,
        detail: &str,
    ) -> Result<Prompt, DataStoreError> {
        let tables = self.schema.list_tables().await?;
        let refs = extract_references(sql);

        // real tables from the query, or the closest real ones to a missing table
        let mut relevant: Vec<String> = Vec::new();
        for name in refs.table_names() {
            match self.schema.resolve_table(&name).await? {
                Some(real) => relevant.push(real),
                None => relevant.extend(
                    rank_suggestions(&name, &tables)
                        .into_iter()
                        .take(SIMILAR_TABLES_IN_PROMPT),
                ),
            }
        }
        relevant.dedup();

        let mut column_lists = String::new();
        for table in &relevant {
            column_lists.push_str(&self.schema.describe_table(table).await?);
        }

        let passages = self
            .knowledge
            .retrieve(question, None, None, self.knowledge_results)
            .await;

        let user = format!(
            "Question: {question}\n\n\
             Failing SQL:\n{sql}\n\n\
             Error ({kind:?}): {detail}\n\n\
             Available tables: {tables}\n\n\
             Actual columns of the relevant tables:\n{columns}\n\
             Schema knowledge:\n{knowledge}\n",
            question = question,
            sql = sql,
            kind = kind,
            detail = detail,
            tables = tables.join(", "),
            columns = column_lists,
            knowledge = if passages.is_empty() {
                "(none)".to_string()
            } else {
                format_passages(&passages)
            },
        );

        Ok(Prompt::new(CORRECTION_SYSTEM_PROMPT, user))
    }
}
