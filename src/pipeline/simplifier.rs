use std::ops::Range;
use tracing::{debug, info};

use super::schema::SchemaIntrospector;
use crate::db::{ExecutionResult, QueryExecutor};
use crate::sql::{structural_check, SelectStatement, TableRef};

/// Rewrite a zero-row join as a single-table query over its primary table.
///
/// Only fragments that reference nothing but the primary table survive: select
/// items, `WHERE` conjuncts and `ORDER BY` items. Qualified names must point at
/// the primary table and unqualified ones must be among `primary_columns`.
/// Grouped queries are left alone because dropping a joined table changes what
/// the groups mean.
pub fn simplify(sql: &str, primary_columns: &[String]) -> Option<String> {
    let stmt = SelectStatement::parse(sql)?;
    if !stmt.has_join() || stmt.has_group_by() {
        return None;
    }
    let primary = stmt.primary_table()?;

    let keep = |range: &Range<usize>, aliases: &[String]| {
        stmt.qualifiers_in(range.clone())
            .iter()
            .all(|q| primary.answers_to(q))
            && stmt.bare_names_in(range.clone()).iter().all(|name| {
                primary_columns.iter().any(|c| c.eq_ignore_ascii_case(name))
                    || aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
            })
    };
    let rewrite = |ranges: Vec<Range<usize>>, aliases: &[String]| -> Vec<String> {
        ranges
            .into_iter()
            .filter(|r| keep(r, aliases))
            .map(|r| stmt.text_without_prefix(r, &primary))
            .collect()
    };

    // ORDER BY may name an output alias of a select item that survived
    let kept_aliases: Vec<String> = stmt
        .select_items()
        .into_iter()
        .filter(|r| keep(r, &[]))
        .flat_map(|r| stmt.aliases_in(r))
        .collect();

    let mut select_items = rewrite(stmt.select_items(), &[]);
    if select_items.is_empty() {
        select_items.push("*".to_string());
    }
    let conditions = rewrite(stmt.where_conditions(), &[]);
    let order_items = rewrite(stmt.order_items(), &kept_aliases);

    let mut out = String::from("SELECT ");
    if stmt.is_distinct() {
        out.push_str("DISTINCT ");
    }
    if let Some(top) = stmt.top_text() {
        out.push_str(top);
        out.push(' ');
    }
    out.push_str(&select_items.join(", "));
    out.push_str(" FROM ");
    out.push_str(&qualified_name(&primary));
    if !conditions.is_empty() {
        out.push_str(" WHERE ");
        out.push_str(&conditions.join(" AND "));
    }
    if !order_items.is_empty() {
        out.push_str(" ORDER BY ");
        out.push_str(&order_items.join(", "));
    }
    if let Some(limit) = stmt.limit_text() {
        out.push(' ');
        out.push_str(limit);
    }

    debug!("Join simplified to: {}", out);
    Some(out)
}

fn qualified_name(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", schema, table.name),
        None => table.name.clone(),
    }
}

/// Run the simplified query once; `Some` only when it finds rows. Every
/// failure is swallowed and leaves the original result in place.
pub async fn try_simplify(
    sql: &str,
    schema: &SchemaIntrospector,
    executor: &dyn QueryExecutor,
) -> Option<(String, ExecutionResult)> {
    let primary = SelectStatement::parse(sql)?.primary_table()?;
    let columns: Vec<String> = match schema.columns(&primary.name).await {
        Ok(columns) => columns.into_iter().map(|c| c.name).collect(),
        Err(e) => {
            debug!("No columns for '{}', not simplifying: {}", primary.name, e);
            return None;
        }
    };
    let simplified = simplify(sql, &columns)?;
    if structural_check(&simplified).is_err() {
        return None;
    }
    match executor.execute(&simplified).await {
        Ok(result) if result.row_count > 0 => {
            info!("Simplified join returned {} rows", result.row_count);
            Some((simplified, result))
        }
        Ok(_) => None,
        Err(e) => {
            debug!("Simplified query failed: {}", e);
            None
        }
    }
}
