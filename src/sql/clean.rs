use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::structure::SelectStatement;
use super::tokenizer::{tokenize, TokenKind};
use crate::config::SqlDialect;

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```\s*sql").expect("valid regex"));
static FIRST_SELECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("valid regex"));
static STATEMENT_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";\s*\n|\n\s*\n").expect("valid regex"));
static DANGEROUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(DROP|DELETE|TRUNCATE|ALTER|CREATE|INSERT|UPDATE)\b").expect("valid regex")
});

/// Pull the first `SELECT` statement out of free-form model output.
///
/// Fences and leading prose are dropped, and the text is cut at the first
/// statement boundary: a `;` or a blank line.
pub fn extract_sql(raw: &str) -> String {
    let unfenced = FENCE_OPEN.replace_all(raw, "").replace("```", "");

    let from_select = match FIRST_SELECT.find(&unfenced) {
        Some(m) => &unfenced[m.start()..],
        None => unfenced.trim(),
    };

    let first = STATEMENT_BREAK
        .split(from_select)
        .next()
        .unwrap_or(from_select);

    // a `;` on the same line as trailing prose
    let cut = tokenize(first)
        .into_iter()
        .find(|t| t.kind == TokenKind::Semicolon)
        .map_or(first, |t| &first[..t.start]);

    cut.trim().to_string()
}

/// Why a candidate failed the structural gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralIssue {
    Empty,
    MissingSelect,
    DangerousOperation,
    ContainsFences,
}

impl fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StructuralIssue::Empty => "query is empty",
            StructuralIssue::MissingSelect => "query does not contain SELECT",
            StructuralIssue::DangerousOperation => "query contains a data-modifying operation",
            StructuralIssue::ContainsFences => "query contains backticks or code fences",
        };
        f.write_str(msg)
    }
}

/// Cheap checks that need no catalog access.
pub fn structural_check(sql: &str) -> Result<(), StructuralIssue> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(StructuralIssue::Empty);
    }
    if !FIRST_SELECT.is_match(trimmed) {
        return Err(StructuralIssue::MissingSelect);
    }
    if DANGEROUS.is_match(trimmed) {
        return Err(StructuralIssue::DangerousOperation);
    }
    if trimmed.contains('`') {
        return Err(StructuralIssue::ContainsFences);
    }
    Ok(())
}

/// The same query rewritten to return zero rows, for binding checks.
pub fn dry_run_sql(sql: &str, dialect: SqlDialect) -> String {
    let body = sql.trim().trim_end_matches(';').trim_end();
    match dialect {
        SqlDialect::DuckDb => format!("SELECT * FROM ({}) AS dry_run LIMIT 0", body),
        SqlDialect::TSql => {
            let Some(stmt) = SelectStatement::parse(body) else {
                return format!("SELECT TOP 0 * FROM ({}) AS dry_run", body);
            };
            match stmt.top_span() {
                Some(span) => format!("{}TOP 0{}", &body[..span.start], &body[span.end..]),
                None => {
                    let at = stmt.modifier_insert_offset();
                    format!("{} TOP 0{}", &body[..at], &body[at..])
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_fenced_prose() {
        let raw = "Here is the query you asked for:\n```sql\nSELECT NAME\nFROM customers;\n```\nIt lists names.";
        assert_eq!(extract_sql(raw), "SELECT NAME\nFROM customers");
    }

    #[test]
    fn stops_at_blank_line_and_inline_semicolon() {
        assert_eq!(
            extract_sql("SELECT 1 FROM t\n\nThis query returns one."),
            "SELECT 1 FROM t"
        );
        assert_eq!(
            extract_sql("SELECT 'a;b' FROM t; -- done"),
            "SELECT 'a;b' FROM t"
        );
    }

    #[test]
    fn structural_gate() {
        assert_eq!(structural_check("   "), Err(StructuralIssue::Empty));
        assert_eq!(
            structural_check("WITH x AS (1) VALUES (1)"),
            Err(StructuralIssue::MissingSelect)
        );
        assert_eq!(
            structural_check("SELECT * FROM t; DROP TABLE t"),
            Err(StructuralIssue::DangerousOperation)
        );
        assert_eq!(
            structural_check("SELECT `name` FROM t"),
            Err(StructuralIssue::ContainsFences)
        );
        assert!(structural_check("SELECT LAST_UPDATED_TS, UPDATED_AT FROM t").is_ok());
    }

    #[test]
    fn tsql_dry_run_goes_after_distinct() {
        assert_eq!(
            dry_run_sql("SELECT DISTINCT NAME FROM customers", SqlDialect::TSql),
            "SELECT DISTINCT TOP 0 NAME FROM customers"
        );
        assert_eq!(
            dry_run_sql("SELECT TOP 100 NAME FROM customers;", SqlDialect::TSql),
            "SELECT TOP 0 NAME FROM customers"
        );
        assert_eq!(
            dry_run_sql("SELECT NAME FROM customers", SqlDialect::TSql),
            "SELECT TOP 0 NAME FROM customers"
        );
    }

    #[test]
    fn duckdb_dry_run_wraps() {
        assert_eq!(
            dry_run_sql("SELECT NAME FROM customers ORDER BY NAME;", SqlDialect::DuckDb),
            "SELECT * FROM (SELECT NAME FROM customers ORDER BY NAME) AS dry_run LIMIT 0"
        );
    }
}
