use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::ExecutionResult;
use crate::error::ErrorKind;
use crate::sql::StructuralIssue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Report,
    Conversation,
}

fn default_true() -> bool {
    true
}

/// Incoming question plus whatever the client remembers from the last turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub query_key: Option<String>,
    #[serde(default = "default_true")]
    pub use_predefined: bool,
    #[serde(default)]
    pub previous_sql_query: Option<String>,
    #[serde(default)]
    pub followup_answers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub skip_followups: bool,
    #[serde(default)]
    pub mode: Mode,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            use_predefined: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    DateSelection,
    Confirmation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub id: String,
    #[serde(rename = "question")]
    pub prompt_text: String,
    #[serde(rename = "type")]
    pub kind: FollowUpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub required: bool,
}

/// Which stage produced the final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentUsed {
    Predefined,
    SqlMaker,
    SqlMakerRepair,
    MultiAgent,
    Followup,
    Conversational,
    Routing,
    ValidatorCorrected(Box<AgentUsed>),
}

impl AgentUsed {
    pub fn label(&self) -> String {
        match self {
            AgentUsed::Predefined => "predefined".to_string(),
            AgentUsed::SqlMaker => "sqlmaker".to_string(),
            AgentUsed::SqlMakerRepair => "sqlmaker_repair".to_string(),
            AgentUsed::MultiAgent => "multi_agent".to_string(),
            AgentUsed::Followup => "followup".to_string(),
            AgentUsed::Conversational => "conversational".to_string(),
            AgentUsed::Routing => "routing".to_string(),
            AgentUsed::ValidatorCorrected(inner) => format!("{}_validator_corrected", inner.label()),
        }
    }

    pub fn corrected(self) -> Self {
        AgentUsed::ValidatorCorrected(Box::new(self))
    }
}

impl Serialize for AgentUsed {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub answer: String,
    pub sql_query: Option<String>,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    pub is_predefined: bool,
    pub question_key: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub is_conversational: bool,
    pub agent_used: AgentUsed,
    pub route_reason: Option<String>,
    pub needs_followup: bool,
    pub followup_questions: Vec<FollowUpQuestion>,
    pub followup_analysis: Option<String>,
}

impl QueryResponse {
    fn base(answer: impl Into<String>, agent_used: AgentUsed) -> Self {
        Self {
            answer: answer.into(),
            sql_query: None,
            data: Vec::new(),
            row_count: 0,
            is_predefined: false,
            question_key: None,
            success: true,
            error: None,
            is_conversational: false,
            agent_used,
            route_reason: None,
            needs_followup: false,
            followup_questions: Vec::new(),
            followup_analysis: None,
        }
    }

    pub fn rows(sql: String, result: ExecutionResult, agent_used: AgentUsed) -> Self {
        let answer = if result.row_count == 0 {
            "No records found matching your query.".to_string()
        } else {
            format!("Found {} record(s).", result.row_count)
        };
        Self {
            sql_query: Some(sql),
            row_count: result.row_count,
            data: result.rows,
            ..Self::base(answer, agent_used)
        }
    }

    pub fn conversational(answer: String, route_reason: Option<String>) -> Self {
        Self {
            is_conversational: true,
            route_reason,
            ..Self::base(answer, AgentUsed::Conversational)
        }
    }

    pub fn cancelled() -> Self {
        Self {
            is_conversational: true,
            route_reason: Some("user_cancelled".to_string()),
            ..Self::base("Cancelled. No query was executed.", AgentUsed::Followup)
        }
    }

    pub fn clarification(
        sql: String,
        questions: Vec<FollowUpQuestion>,
        analysis: String,
    ) -> Self {
        Self {
            sql_query: Some(sql),
            is_conversational: true,
            route_reason: Some("date_or_freshness_clarification".to_string()),
            needs_followup: true,
            followup_questions: questions,
            followup_analysis: Some(analysis),
            ..Self::base(
                "I need a quick clarification before running this report.",
                AgentUsed::Followup,
            )
        }
    }

    pub fn failure(
        answer: impl Into<String>,
        error: impl Into<String>,
        sql: Option<String>,
        agent_used: AgentUsed,
    ) -> Self {
        Self {
            sql_query: sql,
            success: false,
            error: Some(error.into()),
            ..Self::base(answer, agent_used)
        }
    }

    pub fn unexpected(error: &dyn std::fmt::Display) -> Self {
        Self::failure(
            format!("Unexpected error: {}", error),
            error.to_string(),
            None,
            AgentUsed::Routing,
        )
    }

    pub fn with_route_reason(mut self, reason: Option<String>) -> Self {
        if self.route_reason.is_none() {
            self.route_reason = reason;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Predefined,
    ReportSql,
    Conversational,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub route: Route,
    pub reason: String,
    pub predefined_key: Option<String>,
}

/// Generated SQL after extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCandidate {
    pub raw: String,
    /// 1 for the first try, 2 after a repair. Observability only.
    pub attempt: u8,
    pub cleaned: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    Empty,
    MissingSelect,
    DangerousOperation,
    ContainsFences,
    InvalidTable,
    InvalidColumn,
    SyntaxError,
    Other,
}

impl From<StructuralIssue> for ValidationErrorKind {
    fn from(issue: StructuralIssue) -> Self {
        match issue {
            StructuralIssue::Empty => ValidationErrorKind::Empty,
            StructuralIssue::MissingSelect => ValidationErrorKind::MissingSelect,
            StructuralIssue::DangerousOperation => ValidationErrorKind::DangerousOperation,
            StructuralIssue::ContainsFences => ValidationErrorKind::ContainsFences,
        }
    }
}

impl From<ErrorKind> for ValidationErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidTable => ValidationErrorKind::InvalidTable,
            ErrorKind::InvalidColumn => ValidationErrorKind::InvalidColumn,
            ErrorKind::SyntaxError => ValidationErrorKind::SyntaxError,
            _ => ValidationErrorKind::Other,
        }
    }
}

impl ValidationErrorKind {
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ValidationErrorKind::Empty
                | ValidationErrorKind::MissingSelect
                | ValidationErrorKind::DangerousOperation
                | ValidationErrorKind::ContainsFences
        )
    }

    pub fn is_schema_related(&self) -> bool {
        matches!(
            self,
            ValidationErrorKind::InvalidTable | ValidationErrorKind::InvalidColumn
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error_kind: Option<ValidationErrorKind>,
    pub detail: Option<String>,
    pub suggestions: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error_kind: None,
            detail: None,
            suggestions: Vec::new(),
        }
    }

    pub fn failed(kind: ValidationErrorKind, detail: impl Into<String>) -> Self {
        Self {
            valid: false,
            error_kind: Some(kind),
            detail: Some(detail.into()),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

/// Result of a single validate-then-correct pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectionOutcome {
    pub valid: bool,
    pub corrected_sql: String,
    pub error: Option<String>,
    pub error_kind: Option<ValidationErrorKind>,
    pub attempts: u32,
}

/// How stale one table's data is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreshnessRecord {
    #[serde(skip)]
    pub table: String,
    #[serde(rename = "column")]
    pub chosen_column: String,
    pub max_value: Option<String>,
    pub lag_days: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let req: QueryRequest = serde_json::from_str(r#"{"question": "hi"}"#).unwrap();
        assert!(req.use_predefined);
        assert!(!req.skip_followups);
        assert_eq!(req.mode, Mode::Report);

        let req: QueryRequest = serde_json::from_str(
            r#"{"question": "x", "mode": "conversation", "followupAnswers": {"q1": "no"}}"#,
        )
        .unwrap();
        assert_eq!(req.mode, Mode::Conversation);
        assert_eq!(req.followup_answers.unwrap()["q1"], "no");
    }

    #[test]
    fn agent_labels() {
        assert_eq!(AgentUsed::SqlMakerRepair.corrected().label(), "sqlmaker_repair_validator_corrected");
        let json = serde_json::to_value(QueryResponse::cancelled()).unwrap();
        assert_eq!(json["agentUsed"], "followup");
        assert_eq!(json["isConversational"], true);
        assert_eq!(json["rowCount"], 0);
    }

    #[test]
    fn clarification_is_conversational_without_data() {
        let resp = QueryResponse::clarification(
            "SELECT 1".to_string(),
            Vec::new(),
            "stale".to_string(),
        );
        assert!(resp.needs_followup);
        assert!(resp.is_conversational);
        assert!(resp.data.is_empty());
        assert_eq!(resp.agent_used, AgentUsed::Followup);
    }
}
