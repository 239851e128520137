//! Schema knowledge passages: column meanings, valid values, business rules and
//! worked examples, retrieved by keyword overlap with the question.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    TableSchema,
    ColumnDefinition,
    DataPatterns,
    BusinessRule,
    ExampleQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePassage {
    pub table: String,
    #[serde(default)]
    pub column: Option<String>,
    pub kind: KnowledgeKind,
    pub text: String,
}

#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    /// Best-effort lookup; an empty result is a normal answer.
    async fn retrieve(
        &self,
        question: &str,
        tables: Option<&[String]>,
        kinds: Option<&[KnowledgeKind]>,
        max_results: usize,
    ) -> Vec<KnowledgePassage>;
}

#[derive(Debug, Clone, Default)]
pub struct JsonKnowledgeBase {
    passages: Vec<KnowledgePassage>,
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "what", "which", "show", "list", "give",
    "all", "are", "was", "were", "have", "has", "how", "many", "much", "get", "find", "who",
    "whose", "their", "there", "last", "into", "over",
];

impl JsonKnowledgeBase {
    pub fn new(passages: Vec<KnowledgePassage>) -> Self {
        Self { passages }
    }

    /// Load a JSON array of passages. A missing file gives an empty base.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        if !path.exists() {
            warn!("Knowledge file {} not found; continuing without it", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let passages: Vec<KnowledgePassage> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        info!("Loaded {} knowledge passages from {}", passages.len(), path.display());
        Ok(Self { passages })
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .flat_map(|w| {
            // OPEN_DT matches "open" as well as "open_dt"
            let mut parts: Vec<&str> = w.split('_').collect();
            parts.push(w);
            parts
        })
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl KnowledgeRetriever for JsonKnowledgeBase {
    async fn retrieve(
        &self,
        question: &str,
        tables: Option<&[String]>,
        kinds: Option<&[KnowledgeKind]>,
        max_results: usize,
    ) -> Vec<KnowledgePassage> {
        let wanted = terms(question);
        if wanted.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &KnowledgePassage)> = self
            .passages
            .iter()
            .filter(|p| {
                tables.is_none_or(|ts| ts.iter().any(|t| t.eq_ignore_ascii_case(&p.table)))
            })
            .filter(|p| kinds.is_none_or(|ks| ks.contains(&p.kind)))
            .filter_map(|p| {
                let body = terms(&p.text);
                let mut name_terms = terms(&p.table);
                if let Some(col) = &p.column {
                    name_terms.extend(terms(col));
                }
                let score = wanted.intersection(&body).count()
                    + 2 * wanted.intersection(&name_terms).count();
                (score > 0).then_some((score, p))
            })
            .collect();

        // stable: ties keep file order
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(max_results)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// Render passages for a prompt, one bullet each.
pub fn format_passages(passages: &[KnowledgePassage]) -> String {
    passages
        .iter()
        .map(|p| match &p.column {
            Some(col) => format!("- [{}.{}] {}", p.table, col, p.text),
            None => format!("- [{}] {}", p.table, p.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> JsonKnowledgeBase {
        JsonKnowledgeBase::new(vec![
            KnowledgePassage {
                table: "accounts".to_string(),
                column: Some("OPEN_DT".to_string()),
                kind: KnowledgeKind::ColumnDefinition,
                text: "Date the account was opened.".to_string(),
            },
            KnowledgePassage {
                table: "accounts".to_string(),
                column: Some("STATUS".to_string()),
                kind: KnowledgeKind::DataPatterns,
                text: "Valid values: OPEN, CLOSED, DORMANT.".to_string(),
            },
            KnowledgePassage {
                table: "customers".to_string(),
                column: None,
                kind: KnowledgeKind::BusinessRule,
                text: "Dormant customers have no transactions in 12 months.".to_string(),
            },
        ])
    }

    #[tokio::test]
    async fn ranks_by_overlap() {
        let hits = base()
            .retrieve("accounts opened recently that are dormant", None, None, 5)
            .await;
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].table, "accounts");
    }

    #[tokio::test]
    async fn filters_by_table_and_kind() {
        let kb = base();
        let tables = vec!["customers".to_string()];
        let hits = kb.retrieve("dormant", Some(&tables), None, 5).await;
        assert_eq!(hits.len(), 1);

        let kinds = [KnowledgeKind::DataPatterns];
        let hits = kb.retrieve("dormant accounts", None, Some(&kinds), 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].column.as_deref(), Some("STATUS"));
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let kb = JsonKnowledgeBase::load(Path::new("/nonexistent/knowledge.json")).unwrap();
        assert!(kb.is_empty());
        assert!(kb.retrieve("anything", None, None, 3).await.is_empty());
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(
            &path,
            r#"[{"table": "accounts", "kind": "table_schema", "text": "One row per account."}]"#,
        )
        .unwrap();
        assert_eq!(JsonKnowledgeBase::load(&path).unwrap().len(), 1);
    }
}
