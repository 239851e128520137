use serde_json::json;
use tracing::{info, warn};

use super::models::{Route, RouteDecision};
use super::predefined::PredefinedMatcher;
use crate::conversation::is_conversational_query;
use crate::error::DataStoreError;
use crate::llm::models::{LlmReply, RouteReply};
use crate::llm::{LlmManager, Prompt};

const ROUTER_SYSTEM_PROMPT: &str = "You are the router for a banking data assistant.
Decide the correct route for the user's message.

Routes:
- conversational: chatting, explanations, schema questions, or questions about the PREVIOUS result
  (where the data came from, which table was used, what SQL ran).
- report_sql: a request for a report or data that needs SQL to be generated and executed.

Rules:
- If the user asks about the previous result and has_previous_sql_query is true, choose conversational.
- Otherwise choose report_sql only when the user clearly asks to fetch or report data.
- Return ONLY valid JSON: {\"route\": \"conversational|report_sql\", \"reason\": \"short string\"}

Examples:
{\"question\":\"List customers by state\",\"has_previous_sql_query\":false} -> {\"route\":\"report_sql\",\"reason\":\"data_request\"}
{\"question\":\"hi, what can you do?\",\"has_previous_sql_query\":false} -> {\"route\":\"conversational\",\"reason\":\"general_chat\"}
{\"question\":\"from which table we got this data?\",\"has_previous_sql_query\":true} -> {\"route\":\"conversational\",\"reason\":\"followup_about_previous_result\"}
{\"question\":\"run the same report but for >3 months\",\"has_previous_sql_query\":true} -> {\"route\":\"report_sql\",\"reason\":\"new_data_request\"}";

const PREVIEW_CHARS: usize = 500;

/// Chooses between the predefined registry, SQL generation and conversation.
pub struct QuestionRouter {
    matcher: PredefinedMatcher,
    llm: LlmManager,
}

impl QuestionRouter {
    pub fn new(matcher: PredefinedMatcher, llm: LlmManager) -> Self {
        Self { matcher, llm }
    }

    pub async fn decide(
        &self,
        question: &str,
        explicit_key: Option<&str>,
        use_predefined: bool,
        previous_sql: Option<&str>,
    ) -> Result<RouteDecision, DataStoreError> {
        if use_predefined {
            if let Some(key) = self.predefined_key(question, explicit_key).await? {
                return Ok(RouteDecision {
                    route: Route::Predefined,
                    reason: "predefined_match".to_string(),
                    predefined_key: Some(key),
                });
            }
        }

        let previous = previous_sql.map(str::trim).filter(|s| !s.is_empty());
        let decision = self.llm_route(question, previous).await;
        info!("Routed to {:?} ({})", decision.route, decision.reason);
        Ok(decision)
    }

    async fn predefined_key(
        &self,
        question: &str,
        explicit_key: Option<&str>,
    ) -> Result<Option<String>, DataStoreError> {
        if let Some(key) = explicit_key.map(str::trim).filter(|k| !k.is_empty()) {
            if self.matcher.get(key).await?.is_some() {
                return Ok(Some(key.to_string()));
            }
            warn!("Unknown predefined key '{}'; matching on question text", key);
        }
        self.matcher.find(question).await
    }

    async fn llm_route(&self, question: &str, previous: Option<&str>) -> RouteDecision {
        let preview: String = previous
            .map(|s| s.chars().take(PREVIEW_CHARS).collect())
            .unwrap_or_default();
        let payload = json!({
            "question": question,
            "has_previous_sql_query": previous.is_some(),
            "previous_sql_query_preview": preview,
        });

        let fallback_reason = match self
            .llm
            .complete(&Prompt::new(ROUTER_SYSTEM_PROMPT, payload.to_string()))
            .await
        {
            Ok(text) => match LlmReply::<RouteReply>::parse(&text) {
                LlmReply::Parsed(reply) => match route_from_str(&reply.route) {
                    Some(route) => {
                        return RouteDecision {
                            route,
                            reason: reply.reason.unwrap_or_else(|| "llm_router".to_string()),
                            predefined_key: None,
                        };
                    }
                    None => "llm_parse_fallback",
                },
                LlmReply::Unparseable(_) => "llm_parse_fallback",
            },
            Err(e) => {
                warn!("Routing model unavailable: {}", e);
                "fallback_default"
            }
        };

        fallback_route(question, previous.is_some(), fallback_reason)
    }
}

fn route_from_str(route: &str) -> Option<Route> {
    match route.trim() {
        "conversational" => Some(Route::Conversational),
        "report_sql" => Some(Route::ReportSql),
        _ => None,
    }
}

/// Keyword detector first, then a default that depends on previous context.
fn fallback_route(question: &str, has_previous: bool, default_reason: &str) -> RouteDecision {
    let (route, reason) = if is_conversational_query(question) {
        (Route::Conversational, "fallback_keyword")
    } else if has_previous {
        (Route::Conversational, default_reason)
    } else {
        (Route::ReportSql, default_reason)
    };
    RouteDecision {
        route,
        reason: reason.to_string(),
        predefined_key: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::registry::{InMemoryRegistry, PredefinedQuery};
    use crate::llm::testing::ScriptedLlm;
    use std::sync::Arc;

    fn router(llm: LlmManager) -> QuestionRouter {
        let registry = InMemoryRegistry::new(vec![PredefinedQuery {
            key: "dormant".to_string(),
            question: "Show dormant accounts".to_string(),
            sql: "SELECT * FROM accounts WHERE STATUS = 'DORMANT'".to_string(),
            description: String::new(),
            active: true,
        }]);
        QuestionRouter::new(PredefinedMatcher::new(Arc::new(registry)), llm)
    }

    #[tokio::test]
    async fn predefined_match_skips_the_model() {
        let llm = ScriptedLlm::new(vec![]);
        let decision = router(LlmManager::with_provider(llm.clone()))
            .decide("show dormant accounts", None, true, None)
            .await
            .unwrap();
        assert_eq!(decision.route, Route::Predefined);
        assert_eq!(decision.predefined_key.as_deref(), Some("dormant"));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn explicit_key_wins_and_unknown_key_falls_back_to_matching() {
        let r = router(LlmManager::unavailable("off"));
        let decision = r.decide("anything at all", Some("dormant"), true, None).await.unwrap();
        assert_eq!(decision.predefined_key.as_deref(), Some("dormant"));

        let decision = r.decide("Show dormant accounts", Some("missing"), true, None).await.unwrap();
        assert_eq!(decision.predefined_key.as_deref(), Some("dormant"));
    }

    #[tokio::test]
    async fn predefined_disabled_goes_to_the_model() {
        let llm = ScriptedLlm::new(vec![r#"{"route": "report_sql", "reason": "data_request"}"#]);
        let decision = router(LlmManager::with_provider(llm.clone()))
            .decide("Show dormant accounts", None, false, None)
            .await
            .unwrap();
        assert_eq!(decision.route, Route::ReportSql);
        assert_eq!(decision.reason, "data_request");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_model_uses_keywords_then_default() {
        let r = router(LlmManager::unavailable("off"));
        let d = r.decide("hello", None, true, None).await.unwrap();
        assert_eq!((d.route, d.reason.as_str()), (Route::Conversational, "fallback_keyword"));

        let d = r.decide("balances by branch", None, true, None).await.unwrap();
        assert_eq!((d.route, d.reason.as_str()), (Route::ReportSql, "fallback_default"));

        let d = r
            .decide("and by region?", None, true, Some("SELECT * FROM accounts"))
            .await
            .unwrap();
        assert_eq!(d.route, Route::Conversational);
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back() {
        let llm = ScriptedLlm::new(vec!["I would say it's a report", r#"{"route": "maybe"}"#]);
        let r = router(LlmManager::with_provider(llm));
        let d = r.decide("balances by branch", None, false, None).await.unwrap();
        assert_eq!((d.route, d.reason.as_str()), (Route::ReportSql, "llm_parse_fallback"));
        let d = r.decide("balances by branch", None, false, None).await.unwrap();
        assert_eq!(d.reason, "llm_parse_fallback");
    }

    #[tokio::test]
    async fn missing_reason_defaults() {
        let llm = ScriptedLlm::new(vec![r#"{"route": "conversational"}"#]);
        let d = router(LlmManager::with_provider(llm))
            .decide("where did that come from", None, false, Some("SELECT 1"))
            .await
            .unwrap();
        assert_eq!((d.route, d.reason.as_str()), (Route::Conversational, "llm_router"));
    }
}
