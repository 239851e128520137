//! Read-only SQL handling: lexing, reference extraction, statement layout and
//! candidate cleanup.

pub mod clean;
pub mod references;
pub mod structure;
pub mod tokenizer;

pub use clean::{dry_run_sql, extract_sql, structural_check, StructuralIssue};
pub use references::{extract_references, ColumnRef, SqlReferences, TableRef};
pub use structure::SelectStatement;
