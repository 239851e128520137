use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Outcome of decoding a structured LLM reply.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply<T> {
    Parsed(T),
    /// The model answered but not with the JSON shape we asked for.
    Unparseable(String),
}

impl<T: DeserializeOwned> LlmReply<T> {
    /// Decode the first JSON object found in `text`, tolerating fences and prose.
    pub fn parse(text: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<T>(text.trim()) {
            return LlmReply::Parsed(value);
        }
        match extract_json_object(text).and_then(|obj| serde_json::from_str::<T>(obj).ok()) {
            Some(value) => LlmReply::Parsed(value),
            None => LlmReply::Unparseable(text.to_string()),
        }
    }
}

impl<T> LlmReply<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            LlmReply::Parsed(v) => Some(v),
            LlmReply::Unparseable(_) => None,
        }
    }
}

/// Widest `{ ... }` span in the text, if any.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

// Router reply: {"route": "...", "reason": "..."}
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteReply {
    pub route: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// Related/unrelated classification of a previous query
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReuseDecision {
    pub should_reuse: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FollowupReplyQuestion {
    #[serde(default)]
    pub id: Option<String>,
    pub question: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub required: Option<bool>,
}

// Clarification gate reply
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FollowupReply {
    #[serde(default)]
    pub needs_followup: bool,
    #[serde(default)]
    pub followup_questions: Vec<FollowupReplyQuestion>,
    #[serde(default)]
    pub analysis: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_wrapped_in_prose_and_fences() {
        let text = "Sure!\n```json\n{\"route\": \"report_sql\", \"reason\": \"data_request\"}\n```";
        let reply = LlmReply::<RouteReply>::parse(text);
        match reply {
            LlmReply::Parsed(r) => {
                assert_eq!(r.route, "report_sql");
                assert_eq!(r.reason.as_deref(), Some("data_request"));
            }
            other => panic!("expected parsed reply, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_unparseable() {
        let reply = LlmReply::<ReuseDecision>::parse("I think yes");
        assert!(matches!(reply, LlmReply::Unparseable(_)));
    }

    #[test]
    fn followup_reply_defaults_missing_fields() {
        let reply = LlmReply::<FollowupReply>::parse(r#"{"needs_followup": false}"#)
            .ok()
            .unwrap();
        assert!(reply.followup_questions.is_empty());
        assert!(reply.analysis.is_empty());
    }
}
