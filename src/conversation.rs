//! Answers for non-data questions: greetings, capability questions, schema
//! questions and questions about the previous result.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{info, warn};

use crate::knowledge::{format_passages, KnowledgeKind, KnowledgeRetriever};
use crate::llm::{LlmManager, Prompt};
use crate::pipeline::freshness::FreshnessAnalyzer;
use crate::pipeline::schema::SchemaIntrospector;
use crate::sql::extract_references;

pub const FALLBACK_ANSWER: &str = "I'm here to help you query your data using natural language. \
Please ask me questions about your data, or use one of the predefined queries.";

const GREETINGS: &[&str] = &["hi", "hello", "hey", "good morning", "good afternoon", "good evening"];

const CAPABILITY_KEYWORDS: &[&str] = &[
    "what can you do",
    "what do you do",
    "help",
    "capabilities",
    "features",
    "what are you",
    "who are you",
    "introduction",
];

const SCHEMA_KEYWORDS: &[&str] = &[
    "what tables",
    "which tables",
    "list tables",
    "show tables",
    "how many tables",
    "how many table",
    "what columns",
    "which columns",
    "list columns",
    "show columns",
    "how many columns",
    "how many column",
    "tables have",
    "table has",
    "tables with",
    "table with",
    "columns in",
    "column in",
    "fields in",
    "field in",
    "schema",
    "database structure",
    "table structure",
];

const SYSTEM_KEYWORDS: &[&str] = &[
    "how does this work",
    "how to use",
    "how do i",
    "tutorial",
    "guide",
    "instructions",
    "explain",
];

const SCHEMA_CONTEXT_KEYWORDS: &[&str] = &[
    "table", "column", "schema", "field", "structure", "what does", "what is", "what are",
    "meaning", "mean", "represents", "contains", "data", "values", "valid", "pattern",
];

const CONVERSATIONAL_SYSTEM_PROMPT: &str = "You are a friendly assistant for a banking reporting tool that turns questions into SQL reports.
Answer the user's message directly and briefly. Do not write SQL.
When asked about tables or columns, answer only from the schema and knowledge provided.
When asked about the previous result, explain it using the previous SQL, its source tables and the freshness metadata.";

/// Keyword detector used when routing cannot consult the model.
pub fn is_conversational_query(question: &str) -> bool {
    let lower = question.trim().to_lowercase();
    let first_words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(2)
        .collect();
    let opening = first_words.join(" ");

    GREETINGS
        .iter()
        .any(|g| first_words.first() == Some(g) || opening == *g)
        || CAPABILITY_KEYWORDS.iter().any(|k| lower.contains(k))
        || SCHEMA_KEYWORDS.iter().any(|k| lower.contains(k))
        || SYSTEM_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[async_trait]
pub trait ConversationalResponder: Send + Sync {
    /// Always produces text; failures degrade to a canned answer.
    async fn respond(&self, question: &str, previous_sql: Option<&str>, today: NaiveDate) -> String;
}

pub struct LlmConversationalResponder {
    llm: LlmManager,
    schema: Arc<SchemaIntrospector>,
    freshness: Arc<FreshnessAnalyzer>,
    knowledge: Arc<dyn KnowledgeRetriever>,
    knowledge_results: usize,
}

impl LlmConversationalResponder {
    pub fn new(
        llm: LlmManager,
        schema: Arc<SchemaIntrospector>,
        freshness: Arc<FreshnessAnalyzer>,
        knowledge: Arc<dyn KnowledgeRetriever>,
        knowledge_results: usize,
    ) -> Self {
        Self {
            llm,
            schema,
            freshness,
            knowledge,
            knowledge_results,
        }
    }

    async fn previous_result_context(&self, sql: &str, today: NaiveDate) -> String {
        let mut out = format!("\n\nPrevious SQL (for context):\n{}", sql);
        let tables = extract_references(sql).table_names();
        if tables.is_empty() {
            return out;
        }
        out.push_str("\n\nSource tables used in the previous SQL:\n");
        for t in &tables {
            out.push_str(&format!("- {}\n", t));
        }
        match self.freshness.analyze(&tables, today).await {
            Ok(records) if !records.is_empty() => {
                out.push_str("\nFreshness metadata (computed from database):\n");
                for (table, r) in records {
                    out.push_str(&format!(
                        "- {}: max({})={} (lag_days={})\n",
                        table,
                        r.chosen_column,
                        r.max_value.as_deref().unwrap_or("none"),
                        r.lag_days.map_or("unknown".to_string(), |d| d.to_string()),
                    ));
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Freshness for previous result unavailable: {}", e),
        }
        out
    }
}

#[async_trait]
impl ConversationalResponder for LlmConversationalResponder {
    async fn respond(&self, question: &str, previous_sql: Option<&str>, today: NaiveDate) -> String {
        if !self.llm.is_available() {
            return FALLBACK_ANSWER.to_string();
        }

        let lower = question.to_lowercase();
        let mut context = String::new();
        if SCHEMA_CONTEXT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            match self.schema.schema_text().await {
                Ok(text) => context.push_str(&format!("\n\nDatabase schema:\n{}", text)),
                Err(e) => warn!("Schema context unavailable: {}", e),
            }
            let kinds = [
                KnowledgeKind::TableSchema,
                KnowledgeKind::ColumnDefinition,
                KnowledgeKind::DataPatterns,
            ];
            let passages = self
                .knowledge
                .retrieve(question, None, Some(&kinds), self.knowledge_results)
                .await;
            if !passages.is_empty() {
                context.push_str(&format!("\n\nSchema knowledge:\n{}", format_passages(&passages)));
            }
        }
        if let Some(sql) = previous_sql.filter(|s| !s.trim().is_empty()) {
            context.push_str(&self.previous_result_context(sql, today).await);
        }

        let prompt = Prompt::new(
            CONVERSATIONAL_SYSTEM_PROMPT,
            format!("User message: {}{}", question, context),
        );
        match self.llm.complete(&prompt).await {
            Ok(answer) => {
                info!("Conversational answer generated");
                answer.trim().to_string()
            }
            Err(e) => {
                warn!("Conversational answer failed: {}", e);
                format!(
                    "I understand you're asking: '{}'. I'm designed to help you query your database using \
                     natural language. If you're looking for data, try asking questions like \
                     'How many accounts are active?', or pick one of the predefined queries.",
                    question
                )
            }
        }
    }
}
