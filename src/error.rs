use serde::Serialize;
use thiserror::Error;

use crate::llm::LlmError;

/// What a data-store error message says went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTable,
    InvalidColumn,
    SyntaxError,
    OtherExecutionError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTable => "invalid_table",
            ErrorKind::InvalidColumn => "invalid_column",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::OtherExecutionError => "other_execution_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map raw data-store error text onto the pipeline taxonomy.
///
/// Matching is by substring because drivers only give us a message. Column checks
/// come before table checks: "column ... does not exist" must not read as a table.
pub fn classify_execution_error(raw: &str) -> ErrorKind {
    let lower = raw.to_lowercase();

    const COLUMN_MARKERS: &[&str] = &[
        "invalid column",
        "referenced column",
        "column not found",
        "unknown column",
        "ambiguous",
        "cannot resolve",
        "could not be bound",
    ];
    const TABLE_MARKERS: &[&str] = &[
        "invalid object name",
        "table with name",
        "no such table",
        "unknown table",
        "catalog error",
    ];
    const SYNTAX_MARKERS: &[&str] = &["syntax error", "parser error", "incorrect syntax"];

    if COLUMN_MARKERS.iter().any(|m| lower.contains(m))
        || (lower.contains("column") && lower.contains("does not exist"))
    {
        return ErrorKind::InvalidColumn;
    }
    if TABLE_MARKERS.iter().any(|m| lower.contains(m)) || lower.contains("does not exist") {
        return ErrorKind::InvalidTable;
    }
    if SYNTAX_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorKind::SyntaxError;
    }
    ErrorKind::OtherExecutionError
}

/// Errors raised by the catalog and execution adapters.
#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("result encoding error: {0}")]
    Encoding(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<arrow::error::ArrowError> for DataStoreError {
    fn from(e: arrow::error::ArrowError) -> Self {
        DataStoreError::Encoding(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DataStoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        DataStoreError::Task(e.to_string())
    }
}

/// Failures that can leave a pipeline stage.
///
/// Execution and validation problems never surface here: they are classified with
/// [`classify_execution_error`] and answered as responses by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("SQL generation unavailable: {0}")]
    GenerationUnavailable(#[from] LlmError),

    #[error("invalid SQL candidate: {0}")]
    InvalidCandidateStructure(String),

    #[error(transparent)]
    DataStore(#[from] DataStoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sql_server_messages() {
        assert_eq!(
            classify_execution_error("Invalid column name 'CUST_NM'."),
            ErrorKind::InvalidColumn
        );
        assert_eq!(
            classify_execution_error("Invalid object name 'dbo.customer_dim'."),
            ErrorKind::InvalidTable
        );
        assert_eq!(
            classify_execution_error("Incorrect syntax near the keyword 'FROM'."),
            ErrorKind::SyntaxError
        );
    }

    #[test]
    fn classifies_duckdb_messages() {
        assert_eq!(
            classify_execution_error(
                "Catalog Error: Table with name customer_dim does not exist!"
            ),
            ErrorKind::InvalidTable
        );
        assert_eq!(
            classify_execution_error(
                "Binder Error: Referenced column \"foo\" not found in FROM clause!"
            ),
            ErrorKind::InvalidColumn
        );
        assert_eq!(
            classify_execution_error("Parser Error: syntax error at or near \"FORM\""),
            ErrorKind::SyntaxError
        );
        assert_eq!(
            classify_execution_error("Conversion Error: could not convert string"),
            ErrorKind::OtherExecutionError
        );
    }

    #[test]
    fn ambiguous_reference_is_a_column_problem() {
        assert_eq!(
            classify_execution_error("Ambiguous column name 'ACCT_ID'."),
            ErrorKind::InvalidColumn
        );
    }
}
