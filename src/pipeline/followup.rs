use chrono::NaiveDate;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use super::freshness::{date_columns, stale_only, FreshnessAnalyzer};
use super::models::{FollowUpKind, FollowUpQuestion, FreshnessRecord};
use super::schema::SchemaIntrospector;
use crate::error::DataStoreError;
use crate::llm::models::{FollowupReply, FollowupReplyQuestion, LlmReply};
use crate::llm::{LlmManager, Prompt};
use crate::sql::extract_references;
use crate::sql::tokenizer::tokenize;

static TIME_RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(last|past|previous|recent|recently|today|yesterday|this\s+(week|month|quarter|year)|since|ago|within|current|currently|latest|mtd|ytd)\b|\b\d+\s*(days?|weeks?|months?|quarters?|years?)\b",
    )
    .expect("valid regex")
});

static DATE_PHRASED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(date|dated|when|opened|closed|created|joined|updated|between|before|after|during)\b|\b\d{4}-\d{2}-\d{2}\b",
    )
    .expect("valid regex")
});

const FRESHNESS_QUESTION_ID: &str = "freshness_confirmation";

const FOLLOWUP_SYSTEM_PROMPT: &str = "You review a generated SQL query for a banking data assistant before it runs.
Decide whether the user must clarify anything first. Output ONLY valid JSON:
{\"needs_followup\": true|false,
 \"followup_questions\": [{\"id\": \"...\", \"question\": \"...\", \"type\": \"date_selection|confirmation\", \"options\": [\"...\"], \"required\": true}],
 \"analysis\": \"short reason\"}
Rules:
- Ask a date_selection question only when the question is about dates and it is unclear which date column is meant. List every candidate date column as an option.
- Ask a confirmation question when freshness_metadata is not empty and the question wants recent data. Always state the exact max available date and the lag in days.
- Never ask about tables listed in invalid_tables_in_sql.
- Do not ask anything when the intent is clear.";

/// Clarifications the gate decided to ask for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowUpAssessment {
    pub needs_followup: bool,
    pub questions: Vec<FollowUpQuestion>,
    pub analysis: String,
}

impl FollowUpAssessment {
    fn none(analysis: impl Into<String>) -> Self {
        Self {
            needs_followup: false,
            questions: Vec::new(),
            analysis: analysis.into(),
        }
    }
}

/// Facts gathered about a candidate query before asking the model.
struct GateContext {
    valid_tables: Vec<String>,
    invalid_tables: Vec<String>,
    date_columns: BTreeMap<String, Vec<String>>,
    used_date_columns: Vec<String>,
    stale: BTreeMap<String, FreshnessRecord>,
    hint: Option<String>,
}

pub fn is_time_relative(question: &str) -> bool {
    TIME_RELATIVE.is_match(question)
}

pub fn is_date_phrased(question: &str) -> bool {
    DATE_PHRASED.is_match(question) || is_time_relative(question)
}

/// Date column the question names by keyword, else the first one the SQL uses.
fn keyword_hint(
    question: &str,
    date_columns: &BTreeMap<String, Vec<String>>,
    used: &[String],
) -> Option<String> {
    let lower = question.to_lowercase();
    let keywords: Vec<&str> = lower.split_whitespace().filter(|w| w.len() > 3).collect();
    date_columns
        .values()
        .flatten()
        .find(|col| {
            let col_lower = col.to_lowercase();
            keywords.iter().any(|k| col_lower.contains(k))
        })
        .cloned()
        .or_else(|| used.first().cloned())
}

/// Max date (day part) and lag, when both are known.
fn freshness_text(record: &FreshnessRecord) -> Option<(String, i64)> {
    let max = record.max_value.as_deref()?;
    let lag = record.lag_days?;
    Some((max.get(..10).unwrap_or(max).to_string(), lag))
}

fn freshness_question(table: &str, record: &FreshnessRecord) -> Option<FollowUpQuestion> {
    let (date, lag) = freshness_text(record)?;
    Some(FollowUpQuestion {
        id: format!("{}_{}", FRESHNESS_QUESTION_ID, table.to_lowercase()),
        prompt_text: format!(
            "Data in {} is current only up to {} ({} days behind). Continue with the available data?",
            table, date, lag
        ),
        kind: FollowUpKind::Confirmation,
        options: Some(vec!["yes".to_string(), "no".to_string()]),
        required: true,
    })
}

pub struct FollowUpGate {
    schema: Arc<SchemaIntrospector>,
    freshness: Arc<FreshnessAnalyzer>,
    llm: LlmManager,
    threshold_days: i64,
}

impl FollowUpGate {
    pub fn new(
        schema: Arc<SchemaIntrospector>,
        freshness: Arc<FreshnessAnalyzer>,
        llm: LlmManager,
        threshold_days: i64,
    ) -> Self {
        Self {
            schema,
            freshness,
            llm,
            threshold_days,
        }
    }

    /// Decide whether `sql` needs the user's input before it runs.
    pub async fn assess(
        &self,
        question: &str,
        sql: &str,
        today: NaiveDate,
    ) -> Result<FollowUpAssessment, DataStoreError> {
        let ctx = self.gather(question, sql, today).await?;

        if ctx.valid_tables.is_empty() && ctx.invalid_tables.is_empty() {
            return Ok(FollowUpAssessment::none("No source tables detected."));
        }
        if ctx.date_columns.values().all(Vec::is_empty) && ctx.stale.is_empty() {
            debug!("No date columns or stale tables; skipping follow-up analysis");
            return Ok(FollowUpAssessment::none("No date or freshness concerns."));
        }

        let prompt = self.prompt(question, sql, today, &ctx);
        let raw = match self.llm.complete(&prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Follow-up analysis unavailable, continuing without it: {}", e);
                return Ok(FollowUpAssessment::none("Follow-up agent unavailable."));
            }
        };

        let reply = match LlmReply::<FollowupReply>::parse(&raw) {
            LlmReply::Parsed(reply) => reply,
            LlmReply::Unparseable(_) => {
                warn!("Could not parse follow-up output; continuing without it");
                return Ok(FollowUpAssessment::none("Could not parse follow-up output."));
            }
        };

        let questions = self.apply_policy(question, &ctx, reply.followup_questions);
        if !questions.is_empty() {
            info!("Follow-up needed: {} question(s)", questions.len());
        }
        Ok(FollowUpAssessment {
            needs_followup: !questions.is_empty(),
            questions,
            analysis: reply.analysis,
        })
    }

    async fn gather(&self, question: &str, sql: &str, today: NaiveDate) -> Result<GateContext, DataStoreError> {
        let refs = extract_references(sql);

        let mut valid_tables = Vec::new();
        let mut invalid_tables = Vec::new();
        for name in refs.table_names() {
            match self.schema.resolve_table(&name).await? {
                Some(real) => valid_tables.push(real),
                None => {
                    warn!("Follow-up: table '{}' does not exist", name);
                    invalid_tables.push(name);
                }
            }
        }

        let mut date_cols = BTreeMap::new();
        for table in &valid_tables {
            let columns = self.schema.columns(table).await?;
            date_cols.insert(table.clone(), date_columns(&columns, self.freshness.audit_columns()));
        }

        let tokens = tokenize(sql);
        let mut used_date_columns: Vec<String> = Vec::new();
        for col in date_cols.values().flatten() {
            let used = tokens
                .iter()
                .any(|t| t.is_identifier() && t.value.eq_ignore_ascii_case(col));
            if used && !used_date_columns.contains(col) {
                used_date_columns.push(col.clone());
            }
        }

        let records = self.freshness.analyze(&valid_tables, today).await?;
        let stale = stale_only(records, self.threshold_days);
        let hint = keyword_hint(question, &date_cols, &used_date_columns);

        Ok(GateContext {
            valid_tables,
            invalid_tables,
            date_columns: date_cols,
            used_date_columns,
            stale,
            hint,
        })
    }

    fn prompt(&self, question: &str, sql: &str, today: NaiveDate, ctx: &GateContext) -> Prompt {
        let payload = json!({
            "user_question": question,
            "generated_sql_query": sql,
            "source_tables": ctx.valid_tables,
            "invalid_tables_in_sql": ctx.invalid_tables,
            "date_metadata": {
                "candidate_date_columns": ctx.date_columns,
                "date_columns_used_in_sql": ctx.used_date_columns,
                "explicit_date_field_mentioned": ctx.hint,
            },
            "freshness_metadata": ctx.stale,
            "freshness_threshold_days": self.threshold_days,
            "today": today.to_string(),
        });
        let user = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
        Prompt::new(FOLLOWUP_SYSTEM_PROMPT, user)
    }

    /// Keep only the clarifications the rules allow, and make sure a stale,
    /// time-relative question always gets its freshness confirmation.
    fn apply_policy(
        &self,
        question: &str,
        ctx: &GateContext,
        proposed: Vec<FollowupReplyQuestion>,
    ) -> Vec<FollowUpQuestion> {
        let allow_date_selection = is_date_phrased(question) && ctx.hint.is_none();
        let allow_confirmation = !ctx.stale.is_empty() && is_time_relative(question);
        let all_date_columns: Vec<String> = ctx.date_columns.values().flatten().cloned().collect();

        let mut out: Vec<FollowUpQuestion> = Vec::new();
        for (n, q) in proposed.into_iter().enumerate() {
            let id = q.id.unwrap_or_else(|| format!("q{}", n + 1));
            let required = q.required.unwrap_or(true);
            match q.kind.as_deref().unwrap_or("confirmation") {
                "date_selection" if allow_date_selection => {
                    let options = q
                        .options
                        .filter(|o| !o.is_empty())
                        .unwrap_or_else(|| all_date_columns.clone());
                    out.push(FollowUpQuestion {
                        id,
                        prompt_text: q.question,
                        kind: FollowUpKind::DateSelection,
                        options: Some(options),
                        required,
                    });
                }
                "confirmation" if allow_confirmation => {
                    // must restate a real max date and lag
                    let grounded = ctx.stale.values().any(|record| {
                        freshness_text(record).is_some_and(|(date, lag)| {
                            q.question.contains(&date) && q.question.contains(&lag.to_string())
                        })
                    });
                    if grounded {
                        out.push(FollowUpQuestion {
                            id,
                            prompt_text: q.question,
                            kind: FollowUpKind::Confirmation,
                            options: q.options,
                            required,
                        });
                    }
                }
                other => debug!("Dropping follow-up question of type '{}': {}", other, q.question),
            }
        }

        if allow_confirmation {
            for (table, record) in &ctx.stale {
                let Some((date, lag)) = freshness_text(record) else {
                    continue;
                };
                let covered = out.iter().any(|q| {
                    q.kind == FollowUpKind::Confirmation
                        && q.prompt_text.contains(&date)
                        && q.prompt_text.contains(&lag.to_string())
                });
                if !covered {
                    if let Some(q) = freshness_question(table, record) {
                        out.push(q);
                    }
                }
            }
        }

        out
    }
}
