use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::SqlCandidate;
use super::schema::SchemaIntrospector;
use crate::config::SqlDialect;
use crate::error::PipelineError;
use crate::knowledge::{format_passages, KnowledgePassage, KnowledgeRetriever};
use crate::llm::models::{LlmReply, ReuseDecision};
use crate::llm::{LlmManager, Prompt};
use crate::sql::{extract_sql, structural_check};

const REUSE_SYSTEM_PROMPT: &str = "You decide whether a new question modifies a previous SQL query.
Reply ONLY with JSON: {\"should_reuse\": true|false, \"reason\": \"brief explanation\"}
should_reuse is true when the new question refines, filters, sorts or extends the previous query
on the same subject. It is false when the new question is about a different subject.";

fn generation_system_prompt(dialect: SqlDialect) -> String {
    let dialect_rules = match dialect {
        SqlDialect::DuckDb => "Write DuckDB SQL. Use LIMIT to cap rows.",
        SqlDialect::TSql => "Write SQL Server (T-SQL). Use TOP instead of LIMIT.",
    };
    format!(
        "You write a single read-only SQL SELECT query that answers a reporting question.
Rules:
- Use ONLY tables from the table list. Never invent table names.
- Use ONLY columns shown for those tables. Never invent column names.
- Never modify data: no INSERT, UPDATE, DELETE, DROP, ALTER, CREATE or TRUNCATE.
- {}
- Return only the SQL, with no explanation and no markdown.",
        dialect_rules
    )
}

/// Produces candidate SQL for a question, with one local repair.
pub struct SqlGenerator {
    schema: Arc<SchemaIntrospector>,
    knowledge: Arc<dyn KnowledgeRetriever>,
    llm: LlmManager,
    dialect: SqlDialect,
    max_attempts: u8,
    knowledge_results: usize,
}

impl SqlGenerator {
    pub fn new(
        schema: Arc<SchemaIntrospector>,
        knowledge: Arc<dyn KnowledgeRetriever>,
        llm: LlmManager,
        dialect: SqlDialect,
        max_attempts: u8,
        knowledge_results: usize,
    ) -> Self {
        Self {
            schema,
            knowledge,
            llm,
            dialect,
            max_attempts,
            knowledge_results,
        }
    }

    /// Generate SQL for `question`. A structurally invalid candidate is sent back
    /// once with the reason it was rejected.
    pub async fn generate(
        &self,
        question: &str,
        previous_sql: Option<&str>,
    ) -> Result<SqlCandidate, PipelineError> {
        let context = self.context(question).await?;
        let previous = match previous_sql.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sql) => Some((sql, self.is_related(question, sql).await)),
            None => None,
        };

        let mut rejected: Option<(String, String)> = None;
        for attempt in 1..=self.max_attempts {
            let mut user = context.clone();
            match previous {
                Some((sql, true)) => user.push_str(&format!(
                    "\nPrevious SQL (related; modify it to answer the new question):\n{}\n",
                    sql
                )),
                Some((_, false)) => user.push_str(
                    "\nNOTE: a previous SQL query exists but is NOT related to this question. Ignore it.\n",
                ),
                None => {}
            }
            if let Some((candidate, reason)) = &rejected {
                user.push_str(&format!(
                    "\nYour previous answer was rejected ({}). Rejected answer:\n{}\nFix it and return only the SQL.\n",
                    reason, candidate
                ));
            }
            user.push_str(&format!("\nQuestion: {}\n", question));

            let raw = self
                .llm
                .complete(&Prompt::new(generation_system_prompt(self.dialect), user))
                .await?;
            let cleaned = extract_sql(&raw);

            match structural_check(&cleaned) {
                Ok(()) => {
                    info!("SQL generated on attempt {}", attempt);
                    return Ok(SqlCandidate {
                        raw,
                        attempt,
                        cleaned,
                    });
                }
                Err(issue) => {
                    warn!("Attempt {} produced an invalid candidate: {}", attempt, issue);
                    rejected = Some((raw, issue.to_string()));
                }
            }
        }

        let reason = rejected.map(|(_, r)| r).unwrap_or_default();
        Err(PipelineError::InvalidCandidateStructure(reason))
    }

    /// One more generation with a blunt prompt after the regular attempts failed.
    /// The candidate is returned without a structural check; the caller gates it.
    pub async fn fallback(&self, question: &str, failure: &str) -> Result<SqlCandidate, PipelineError> {
        let tables = self.schema.list_tables().await?;
        let mut schema_preview = self.schema.schema_text().await?;
        if let Some((cut, _)) = schema_preview.char_indices().nth(2000) {
            schema_preview.truncate(cut);
        }

        let user = format!(
            "Generate a SQL SELECT query for the following question.\n\n\
             Question: {}\n\n\
             Previous attempt error: {}\n\n\
             Available tables: {}\n\n\
             Schema:\n{}\n\
             Instructions:\n\
             1. Identify which tables and columns are needed.\n\
             2. Use proper JOINs if multiple tables are needed.\n\
             3. Return ONLY the SQL query.",
            question,
            if failure.is_empty() { "the first generator could not produce SQL" } else { failure },
            tables.join(", "),
            schema_preview,
        );

        let raw = self
            .llm
            .complete(&Prompt::new(generation_system_prompt(self.dialect), user))
            .await?;
        let cleaned = extract_sql(&raw);
        Ok(SqlCandidate {
            raw,
            attempt: self.max_attempts + 1,
            cleaned,
        })
    }

    async fn is_related(&self, question: &str, previous_sql: &str) -> bool {
        let prompt = Prompt::new(
            REUSE_SYSTEM_PROMPT,
            format!("Previous SQL:\n{}\n\nNew question: {}", previous_sql, question),
        );
        match self.llm.complete(&prompt).await {
            Ok(text) => match LlmReply::<ReuseDecision>::parse(&text) {
                LlmReply::Parsed(decision) => {
                    info!(
                        "Previous SQL related: {} ({})",
                        decision.should_reuse, decision.reason
                    );
                    decision.should_reuse
                }
                LlmReply::Unparseable(_) => false,
            },
            Err(e) => {
                warn!("Reuse classification failed, treating previous SQL as unrelated: {}", e);
                false
            }
        }
    }

    /// Schema, table list, knowledge and exact columns of tables the knowledge mentions.
    async fn context(&self, question: &str) -> Result<String, PipelineError> {
        let tables = self.schema.list_tables().await?;
        let schema_text = self.schema.schema_text().await?;
        let passages = self
            .knowledge
            .retrieve(question, None, None, self.knowledge_results)
            .await;

        let mut out = format!(
            "Available tables (use ONLY these): {}\n\nSchema:\n{}",
            tables.join(", "),
            schema_text
        );

        if !passages.is_empty() {
            out.push_str(&format!("\nSchema knowledge:\n{}\n", format_passages(&passages)));
            let exact = self.knowledge_columns(&passages, &tables).await?;
            if !exact.is_empty() {
                out.push_str(&format!("\nExact columns of the tables above:\n{}", exact));
            }
        }
        Ok(out)
    }

    async fn knowledge_columns(
        &self,
        passages: &[KnowledgePassage],
        tables: &[String],
    ) -> Result<String, PipelineError> {
        let mentioned: BTreeSet<&String> = passages
            .iter()
            .filter_map(|p| tables.iter().find(|t| t.eq_ignore_ascii_case(&p.table)))
            .collect();
        let mut out = String::new();
        for table in mentioned {
            out.push_str(&self.schema.describe_table(table).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{JsonKnowledgeBase, KnowledgeKind};
    use crate::llm::testing::ScriptedLlm;
    use crate::pipeline::schema::testing::StaticCatalog;

    fn generator(llm: LlmManager) -> SqlGenerator {
        let catalog = StaticCatalog::new(&[
            ("accounts", &[("ACCT_ID", "INTEGER"), ("STATUS", "VARCHAR")]),
            ("customers", &[("CUST_ID", "INTEGER"), ("NAME", "VARCHAR")]),
        ]);
        let knowledge = JsonKnowledgeBase::new(vec![KnowledgePassage {
            table: "accounts".to_string(),
            column: Some("STATUS".to_string()),
            kind: KnowledgeKind::DataPatterns,
            text: "Dormant accounts have STATUS = 'DORMANT'.".to_string(),
        }]);
        SqlGenerator::new(
            Arc::new(SchemaIntrospector::new(Arc::new(catalog))),
            Arc::new(knowledge),
            llm,
            SqlDialect::DuckDb,
            2,
            5,
        )
    }

    #[tokio::test]
    async fn first_attempt_is_extracted() {
        let llm = ScriptedLlm::new(vec!["Here you go:\n```sql\nSELECT * FROM accounts WHERE STATUS = 'DORMANT';\n```"]);
        let candidate = generator(LlmManager::with_provider(llm.clone()))
            .generate("show dormant accounts", None)
            .await
            .unwrap();
        assert_eq!(candidate.attempt, 1);
        assert_eq!(candidate.cleaned, "SELECT * FROM accounts WHERE STATUS = 'DORMANT'");

        let prompt = &llm.prompts.lock().unwrap()[0];
        assert!(prompt.user.contains("Available tables (use ONLY these): accounts, customers"));
        assert!(prompt.user.contains("STATUS = 'DORMANT'"));
        assert!(prompt.system.contains("LIMIT"));
    }

    #[tokio::test]
    async fn structural_failure_gets_one_repair() {
        let llm = ScriptedLlm::new(vec!["DELETE FROM accounts", "SELECT ACCT_ID FROM accounts"]);
        let candidate = generator(LlmManager::with_provider(llm.clone()))
            .generate("show accounts", None)
            .await
            .unwrap();
        assert_eq!(candidate.attempt, 2);
        let repair = &llm.prompts.lock().unwrap()[1];
        assert!(repair.user.contains("DELETE FROM accounts"));
        assert!(repair.user.contains("does not contain SELECT"));
    }

    #[tokio::test]
    async fn two_structural_failures_are_reported() {
        let llm = ScriptedLlm::new(vec!["no idea", "still no idea"]);
        let err = generator(LlmManager::with_provider(llm.clone()))
            .generate("show accounts", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidCandidateStructure(_)));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn unavailable_capability_is_generation_unavailable() {
        let err = generator(LlmManager::unavailable("down"))
            .generate("show accounts", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GenerationUnavailable(_)));
    }

    #[tokio::test]
    async fn unrelated_previous_sql_is_marked() {
        let llm = ScriptedLlm::new(vec![
            r#"{"should_reuse": false, "reason": "different subject"}"#,
            "SELECT NAME FROM customers",
        ]);
        generator(LlmManager::with_provider(llm.clone()))
            .generate("list customer names", Some("SELECT * FROM accounts"))
            .await
            .unwrap();
        let prompt = &llm.prompts.lock().unwrap()[1];
        assert!(prompt.user.contains("NOT related"));
        assert!(!prompt.user.contains("SELECT * FROM accounts"));
    }

    #[tokio::test]
    async fn related_previous_sql_is_included() {
        let llm = ScriptedLlm::new(vec![
            "```json\n{\"should_reuse\": true, \"reason\": \"adds a filter\"}\n```",
            "SELECT * FROM accounts WHERE STATUS = 'OPEN'",
        ]);
        generator(LlmManager::with_provider(llm.clone()))
            .generate("only the open ones", Some("SELECT * FROM accounts"))
            .await
            .unwrap();
        let prompt = &llm.prompts.lock().unwrap()[1];
        assert!(prompt.user.contains("Previous SQL (related"));
        assert!(prompt.user.contains("SELECT * FROM accounts"));
    }

    #[tokio::test]
    async fn fallback_skips_the_structural_gate() {
        let llm = ScriptedLlm::new(vec!["SELECT CUST_ID FROM customers"]);
        let candidate = generator(LlmManager::with_provider(llm.clone()))
            .fallback("customer ids", "query does not contain SELECT")
            .await
            .unwrap();
        assert_eq!(candidate.attempt, 3);
        assert!(llm.prompts.lock().unwrap()[0].user.contains("Previous attempt error: query does not contain SELECT"));
    }
}
