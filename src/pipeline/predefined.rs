use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use crate::db::registry::{PredefinedQuery, PredefinedRegistry};
use crate::error::DataStoreError;

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static TIME_THRESHOLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([<>]=?|=)\s*(\d+(?:\.\d+)?)\s*(days?|months?|years?)\b").expect("valid regex")
});
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid regex"));

const MIN_SIMILARITY: f64 = 0.98;
const MAX_DIFFERENCE_RATIO: f64 = 0.05;
const MIN_COMMON_WORDS: usize = 10;
const MIN_LENGTH_RATIO: f64 = 0.8;

/// Lower-case, punctuation to spaces, whitespace collapsed.
pub fn normalize(text: &str) -> String {
    let lower = text.to_lowercase();
    let spaced = PUNCTUATION.replace_all(&lower, " ");
    WHITESPACE.replace_all(&spaced, " ").trim().to_string()
}

fn words(normalized: &str) -> HashSet<&str> {
    normalized.split(' ').filter(|w| w.chars().count() > 1).collect()
}

/// `(operator, number, unit)` with the unit singular, e.g. `(">", "6", "month")`.
fn time_thresholds(text: &str) -> HashSet<(String, String, String)> {
    TIME_THRESHOLD
        .captures_iter(text)
        .map(|c| {
            let unit = c[3].to_lowercase();
            let unit = unit.strip_suffix('s').unwrap_or(&unit).to_string();
            (c[1].to_string(), c[2].to_string(), unit)
        })
        .collect()
}

fn numbers(text: &str) -> HashSet<&str> {
    NUMBER.find_iter(text).map(|m| m.as_str()).collect()
}

/// Numeric guardrail: thresholds (or, failing that, bare numbers) must agree exactly.
fn thresholds_agree(user: &str, candidate: &str) -> bool {
    let user_time = time_thresholds(user);
    let cand_time = time_thresholds(candidate);
    if !user_time.is_empty() || !cand_time.is_empty() {
        return user_time == cand_time;
    }
    numbers(user) == numbers(candidate)
}

/// Jaccard similarity if the pair passes every strictness gate.
fn strict_similarity(user_words: &HashSet<&str>, cand_words: &HashSet<&str>) -> Option<f64> {
    if user_words.is_empty() || cand_words.is_empty() {
        return None;
    }
    let common = user_words.intersection(cand_words).count();
    let union = user_words.union(cand_words).count();
    let similarity = common as f64 / union as f64;
    let difference_ratio = (union - common) as f64 / union as f64;
    let length_ratio = user_words.len().min(cand_words.len()) as f64
        / user_words.len().max(cand_words.len()) as f64;

    (similarity >= MIN_SIMILARITY
        && difference_ratio < MAX_DIFFERENCE_RATIO
        && common >= MIN_COMMON_WORDS
        && length_ratio >= MIN_LENGTH_RATIO)
        .then_some(similarity)
}

/// Key of the registry entry `question` asks for, if any.
pub fn match_question(question: &str, entries: &[PredefinedQuery]) -> Option<String> {
    let user_lower = question.trim().to_lowercase();
    let user_normalized = normalize(&user_lower);
    let user_words = words(&user_normalized);

    let mut best: Option<(f64, &str)> = None;
    for entry in entries.iter().filter(|e| e.active) {
        let cand_lower = entry.question.trim().to_lowercase();
        let cand_normalized = normalize(&cand_lower);

        if user_normalized == cand_normalized {
            return Some(entry.key.clone());
        }

        let cand_words = words(&cand_normalized);
        let Some(similarity) = strict_similarity(&user_words, &cand_words) else {
            continue;
        };
        if !thresholds_agree(&user_lower, &cand_lower) {
            debug!("Predefined '{}' rejected on numeric thresholds", entry.key);
            continue;
        }
        if best.is_none_or(|(s, _)| similarity > s) {
            best = Some((similarity, &entry.key));
        }
    }

    best.map(|(_, key)| key.to_string())
}

/// Strict question-to-registry matcher.
#[derive(Clone)]
pub struct PredefinedMatcher {
    registry: Arc<dyn PredefinedRegistry>,
}

impl PredefinedMatcher {
    pub fn new(registry: Arc<dyn PredefinedRegistry>) -> Self {
        Self { registry }
    }

    pub async fn find(&self, question: &str) -> Result<Option<String>, DataStoreError> {
        let entries = self.registry.active().await?;
        let key = match_question(question, &entries);
        if let Some(key) = &key {
            info!("Question matched predefined query '{}'", key);
        }
        Ok(key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<PredefinedQuery>, DataStoreError> {
        self.registry.get(key).await
    }

    pub async fn list(&self) -> Result<Vec<PredefinedQuery>, DataStoreError> {
        self.registry.active().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, question: &str) -> PredefinedQuery {
        PredefinedQuery {
            key: key.to_string(),
            question: question.to_string(),
            sql: format!("SELECT '{}'", key),
            description: String::new(),
            active: true,
        }
    }

    const LONG: &str = "List all savings accounts opened by retail customers in the northern \
                        region with balance above the minimum requirement and status active";

    #[test]
    fn every_entry_matches_its_own_question() {
        let entries = vec![
            entry("dormant", "Show dormant accounts"),
            entry("long", LONG),
            entry("aging", "Accounts with no activity for >6 months"),
        ];
        for e in &entries {
            assert_eq!(match_question(&e.question, &entries), Some(e.key.clone()));
        }
    }

    #[test]
    fn punctuation_and_case_are_ignored() {
        let entries = vec![entry("dormant", "Show dormant accounts")];
        assert_eq!(
            match_question("  show DORMANT accounts?! ", &entries),
            Some("dormant".to_string())
        );
    }

    #[test]
    fn time_thresholds_must_match() {
        let base = "Accounts with no customer initiated activity in the savings or current \
                    product family for";
        let entries = vec![entry("six", &format!("{} >6 months", base))];
        assert_eq!(match_question(&format!("{} >2 months", base), &entries), None);
        assert_eq!(
            match_question(&format!("{} > 6 months", base), &entries),
            Some("six".to_string())
        );
    }

    #[test]
    fn bare_numbers_must_match() {
        let base = "Top customers by total deposit balance across every branch in the \
                    metropolitan region for year";
        let entries = vec![entry("y2023", &format!("{} 2023", base))];
        assert_eq!(match_question(&format!("{} 2024", base), &entries), None);
    }

    #[test]
    fn near_paraphrase_is_not_enough() {
        let entries = vec![entry("long", LONG)];
        let paraphrase = LONG.replace("northern", "southern");
        assert_eq!(match_question(&paraphrase, &entries), None);
    }

    #[test]
    fn inactive_entries_never_match() {
        let mut e = entry("dormant", "Show dormant accounts");
        e.active = false;
        assert_eq!(match_question("Show dormant accounts", &[e]), None);
    }
}
