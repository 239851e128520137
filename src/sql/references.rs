use std::collections::HashSet;

use super::tokenizer::{tokenize, Token, TokenKind};

/// A table named in a `FROM` or `JOIN` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// True when `qualifier` names this table either by alias or by name.
    pub fn answers_to(&self, qualifier: &str) -> bool {
        self.alias
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(qualifier))
            || self.name.eq_ignore_ascii_case(qualifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: String,
}

/// Every table and column the statement names, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlReferences {
    pub tables: Vec<TableRef>,
    /// Qualified references anywhere, plus unqualified ones inside `WHERE`.
    pub columns: Vec<ColumnRef>,
    /// Names introduced by CTEs or derived tables; not catalog objects.
    pub derived: Vec<String>,
}

impl SqlReferences {
    /// The table a qualifier points at, if it is one of ours.
    pub fn resolve(&self, qualifier: &str) -> Option<&TableRef> {
        self.tables
            .iter()
            .find(|t| t.alias.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(qualifier)))
            .or_else(|| self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(qualifier)))
    }

    pub fn is_derived(&self, name: &str) -> bool {
        self.derived.iter().any(|d| d.eq_ignore_ascii_case(name))
    }

    /// Distinct catalog table names, first occurrence order.
    pub fn table_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tables
            .iter()
            .filter(|t| seen.insert(t.name.to_lowercase()))
            .map(|t| t.name.clone())
            .collect()
    }
}

/// Words that can never be an alias or an unqualified column.
pub(crate) const RESERVED: &[&str] = &[
    "select", "from", "where", "join", "inner", "left", "right", "full", "outer", "cross", "on",
    "and", "or", "not", "in", "is", "null", "like", "ilike", "between", "exists", "case", "when",
    "then", "else", "end", "as", "group", "by", "order", "having", "limit", "offset", "top",
    "distinct", "union", "all", "intersect", "except", "asc", "desc", "with", "using", "natural",
    "true", "false", "cast", "convert", "interval", "current_date", "current_timestamp", "fetch",
    "next", "rows", "only", "over", "partition", "any", "some", "escape", "percent", "ties",
    // date parts, interval units and types that appear bare inside expressions
    "year", "quarter", "month", "week", "day", "hour", "minute", "second", "yy", "yyyy", "qq",
    "mm", "dd", "wk", "hh", "mi", "ss", "years", "quarters", "months", "weeks", "days", "hours",
    "minutes", "seconds", "millisecond", "milliseconds", "microsecond", "microseconds", "decade",
    "century", "millennium", "epoch", "dow", "doy", "isodow", "date", "datetime", "datetime2",
    "timestamp", "timestamptz", "time", "timetz", "varchar", "nvarchar", "char", "int",
    "integer", "bigint", "smallint", "tinyint", "hugeint", "ubigint", "uinteger", "decimal",
    "numeric", "float", "double", "real", "bit", "boolean", "bool", "text", "money", "uuid",
    "blob", "json",
    // TRIM(... FROM x), AT TIME ZONE
    "leading", "trailing", "both", "at", "zone",
];

pub(crate) fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

/// Keywords that end a `WHERE` clause at the same nesting depth.
const WHERE_TERMINATORS: &[&str] = &[
    "group", "order", "having", "union", "intersect", "except", "limit", "offset", "fetch",
];

pub fn extract_references(sql: &str) -> SqlReferences {
    let tokens = tokenize(sql);
    let mut refs = SqlReferences::default();
    // token indexes already consumed as part of a table name
    let mut in_table_position: HashSet<usize> = HashSet::new();

    collect_ctes(&tokens, &mut refs);

    // paren depth at which a derived table was opened
    let mut derived_opens: Vec<usize> = Vec::new();
    // one entry per open paren: is it a function call's argument list?
    let mut calls: Vec<bool> = Vec::new();
    let mut depth = 0usize;
    let mut in_from_list = false;
    let mut from_depth = 0usize;

    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        match tok.kind {
            TokenKind::LParen => {
                depth += 1;
                let subquery = tokens.get(i + 1).is_some_and(|t| t.is_keyword("select"));
                calls.push(!subquery && i > 0 && is_function_name(&tokens[i - 1]));
            }
            TokenKind::RParen => {
                calls.pop();
                if derived_opens.last() == Some(&depth) {
                    derived_opens.pop();
                    if let Some((alias, next)) = parse_alias(&tokens, i + 1) {
                        refs.derived.push(alias);
                        i = next;
                        depth = depth.saturating_sub(1);
                        continue;
                    }
                }
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }

        // EXTRACT(YEAR FROM x), TRIM(BOTH FROM x), a IS DISTINCT FROM b
        let expression_from = tok.is_keyword("from")
            && (calls.last() == Some(&true) || (i > 0 && tokens[i - 1].is_keyword("distinct")));

        let starts_table = (tok.is_keyword("from") && !expression_from)
            || tok.is_keyword("join")
            || (in_from_list && depth == from_depth && tok.kind == TokenKind::Comma);

        if starts_table {
            if tok.is_keyword("from") {
                in_from_list = true;
                from_depth = depth;
            } else if tok.is_keyword("join") {
                in_from_list = false;
            }

            match tokens.get(i + 1) {
                Some(next) if next.kind == TokenKind::LParen => {
                    derived_opens.push(depth + 1);
                }
                Some(next) if next.is_identifier() && !is_reserved(&next.value) => {
                    let (table, after) = parse_table(&tokens, i + 1);
                    for idx in i + 1..after {
                        in_table_position.insert(idx);
                    }
                    if !refs.is_derived(&table.name) {
                        refs.tables.push(table);
                    }
                    i = after;
                    continue;
                }
                _ => {}
            }
        } else if tok.kind == TokenKind::Word
            && !tok.is_keyword("from")
            && depth == from_depth
            && is_clause_boundary(tok)
        {
            in_from_list = false;
        }

        i += 1;
    }

    collect_columns(&tokens, &in_table_position, &mut refs);
    refs
}

/// A bare word directly before `(` that is not a keyword opens an argument list.
fn is_function_name(tok: &Token) -> bool {
    tok.kind == TokenKind::Word && !is_reserved(&tok.value)
}

fn is_clause_boundary(tok: &Token) -> bool {
    ["where", "group", "order", "having", "union", "limit", "join", "on", "select"]
        .iter()
        .any(|k| tok.is_keyword(k))
}

/// `WITH name AS (` and `, name AS (` register CTE names.
fn collect_ctes(tokens: &[Token], refs: &mut SqlReferences) {
    for (i, tok) in tokens.iter().enumerate() {
        let opener = tok.is_keyword("with") || tok.kind == TokenKind::Comma;
        if !opener {
            continue;
        }
        if let (Some(name), Some(as_kw), Some(paren)) =
            (tokens.get(i + 1), tokens.get(i + 2), tokens.get(i + 3))
        {
            if name.is_identifier() && as_kw.is_keyword("as") && paren.kind == TokenKind::LParen {
                refs.derived.push(name.value.clone());
            }
        }
    }
}

/// `[schema .] name [[AS] alias]` starting at `start`; returns the ref and the next index.
fn parse_table(tokens: &[Token], start: usize) -> (TableRef, usize) {
    let mut parts = vec![tokens[start].value.clone()];
    let mut i = start + 1;
    while i + 1 < tokens.len()
        && tokens[i].kind == TokenKind::Dot
        && tokens[i + 1].is_identifier()
    {
        parts.push(tokens[i + 1].value.clone());
        i += 2;
    }

    let name = parts.pop().unwrap_or_default();
    let schema = parts.pop();

    let (alias, next) = match parse_alias(tokens, i) {
        Some((alias, next)) => (Some(alias), next),
        None => (None, i),
    };

    (TableRef { schema, name, alias }, next)
}

fn parse_alias(tokens: &[Token], i: usize) -> Option<(String, usize)> {
    let tok = tokens.get(i)?;
    if tok.is_keyword("as") {
        let alias = tokens.get(i + 1)?;
        return alias.is_identifier().then(|| (alias.value.clone(), i + 2));
    }
    // reserved words cover hints like `WITH (NOLOCK)` and the next clause keyword
    if tok.kind == TokenKind::QuotedIdent || (tok.kind == TokenKind::Word && !is_reserved(&tok.value))
    {
        return Some((tok.value.clone(), i + 1));
    }
    None
}

fn collect_columns(tokens: &[Token], skip: &HashSet<usize>, refs: &mut SqlReferences) {
    // one entry per open paren: does it start a subquery?
    let mut parens: Vec<bool> = Vec::new();
    // paren depth of each active WHERE clause
    let mut wheres: Vec<usize> = Vec::new();

    for (i, tok) in tokens.iter().enumerate() {
        match tok.kind {
            TokenKind::LParen => {
                let subquery = tokens.get(i + 1).is_some_and(|t| t.is_keyword("select"));
                parens.push(subquery);
                continue;
            }
            TokenKind::RParen => {
                if wheres.last() == Some(&parens.len()) {
                    wheres.pop();
                }
                parens.pop();
                continue;
            }
            _ => {}
        }

        if tok.is_keyword("where") {
            wheres.push(parens.len());
            continue;
        }
        if wheres.last() == Some(&parens.len())
            && (WHERE_TERMINATORS.iter().any(|k| tok.is_keyword(k))
                || tok.kind == TokenKind::Semicolon)
        {
            wheres.pop();
        }

        if skip.contains(&i) || !tok.is_identifier() {
            continue;
        }

        // handled when we saw the qualifier
        if i > 0 && tokens[i - 1].kind == TokenKind::Dot {
            continue;
        }
        // target type of a `::` cast
        if i > 0 && tokens[i - 1].kind == TokenKind::Operator && tokens[i - 1].value == "::" {
            continue;
        }

        let next = tokens.get(i + 1);
        if next.is_some_and(|n| n.kind == TokenKind::Dot) {
            // walk a.b or a.b.c; the last identifier is the column
            let mut chain = vec![tok.value.clone()];
            let mut j = i + 1;
            let mut ends_in_star = false;
            while j + 1 < tokens.len() && tokens[j].kind == TokenKind::Dot {
                match tokens[j + 1].kind {
                    TokenKind::Word | TokenKind::QuotedIdent if !skip.contains(&(j + 1)) => {
                        chain.push(tokens[j + 1].value.clone())
                    }
                    TokenKind::Star => ends_in_star = true,
                    _ => {}
                }
                j += 2;
            }
            // function call like dbo.fn(...)
            let is_call = tokens.get(j).is_some_and(|t| t.kind == TokenKind::LParen);
            if ends_in_star || is_call || chain.len() < 2 {
                continue;
            }
            let column = chain.pop().unwrap_or_default();
            let qualifier = chain.pop();
            refs.columns.push(ColumnRef { qualifier, column });
            continue;
        }

        let Some(&where_depth) = wheres.last() else {
            continue;
        };
        let in_subquery = parens[where_depth.min(parens.len())..].iter().any(|s| *s);
        let is_call = next.is_some_and(|n| n.kind == TokenKind::LParen);
        let is_bare_keyword = tok.kind == TokenKind::Word && is_reserved(&tok.value);
        if !in_subquery && !is_call && !is_bare_keyword {
            refs.columns.push(ColumnRef {
                qualifier: None,
                column: tok.value.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(schema: Option<&str>, name: &str, alias: Option<&str>) -> TableRef {
        TableRef {
            schema: schema.map(str::to_string),
            name: name.to_string(),
            alias: alias.map(str::to_string),
        }
    }

    fn col(q: Option<&str>, c: &str) -> ColumnRef {
        ColumnRef {
            qualifier: q.map(str::to_string),
            column: c.to_string(),
        }
    }

    #[test]
    fn finds_tables_with_and_without_aliases() {
        let refs = extract_references(
            "SELECT a.ACCT_ID, c.NAME FROM dbo.accounts AS a \
             JOIN customers c ON a.CUST_ID = c.CUST_ID \
             LEFT JOIN branches ON branches.ID = a.BRANCH_ID",
        );
        assert_eq!(
            refs.tables,
            vec![
                table(Some("dbo"), "accounts", Some("a")),
                table(None, "customers", Some("c")),
                table(None, "branches", None),
            ]
        );
        assert_eq!(refs.resolve("c").map(|t| t.name.as_str()), Some("customers"));
        assert_eq!(refs.resolve("branches").map(|t| t.name.as_str()), Some("branches"));
    }

    #[test]
    fn comma_separated_from_list() {
        let refs = extract_references("SELECT * FROM accounts a, customers c WHERE a.ID = c.ID");
        assert_eq!(refs.table_names(), vec!["accounts", "customers"]);
    }

    #[test]
    fn qualified_and_unqualified_where_columns() {
        let refs = extract_references(
            "SELECT a.ACCT_ID FROM accounts a \
             WHERE STATUS = 'OPEN' AND a.OPEN_DT >= DATEADD(month, -6, GETDATE()) \
             ORDER BY a.OPEN_DT",
        );
        assert_eq!(
            refs.columns,
            vec![
                col(Some("a"), "ACCT_ID"),
                col(None, "STATUS"),
                col(Some("a"), "OPEN_DT"),
                col(Some("a"), "OPEN_DT"),
            ]
        );
    }

    #[test]
    fn select_list_bare_names_are_not_collected() {
        let refs = extract_references("SELECT NAME, COUNT(*) AS n FROM customers GROUP BY NAME");
        assert!(refs.columns.is_empty());
    }

    #[test]
    fn cte_and_derived_names_are_not_tables() {
        let refs = extract_references(
            "WITH recent AS (SELECT * FROM accounts) \
             SELECT r.ID FROM recent r JOIN (SELECT ID FROM customers) AS cc ON cc.ID = r.ID",
        );
        assert_eq!(refs.table_names(), vec!["accounts", "customers"]);
        assert!(refs.is_derived("recent"));
        assert!(refs.is_derived("cc"));
    }

    #[test]
    fn duckdb_expressions_are_not_tables_or_columns() {
        let refs = extract_references(
            "SELECT a.ACCT_ID FROM accounts a \
             WHERE a.OPEN_DT >= DATE '2025-03-20' - INTERVAL 30 DAYS \
             AND EXTRACT(YEAR FROM a.OPEN_DT) = 2025 \
             AND a.CLOSE_TS::TIMESTAMPTZ > now() \
             AND STATUS IS DISTINCT FROM 'CLOSED'",
        );
        assert_eq!(refs.tables, vec![table(None, "accounts", Some("a"))]);
        assert_eq!(
            refs.columns,
            vec![
                col(Some("a"), "ACCT_ID"),
                col(Some("a"), "OPEN_DT"),
                col(Some("a"), "OPEN_DT"),
                col(Some("a"), "CLOSE_TS"),
                col(None, "STATUS"),
            ]
        );
    }

    #[test]
    fn subquery_inside_a_call_still_names_its_table() {
        let refs = extract_references(
            "SELECT COALESCE((SELECT MAX(BALANCE) FROM balances), 0) AS top_balance FROM accounts",
        );
        assert_eq!(refs.table_names(), vec!["balances", "accounts"]);
    }

    #[test]
    fn star_and_schema_qualified_names() {
        let refs = extract_references("SELECT a.* FROM main.accounts a WHERE main.accounts.ID > 1");
        assert_eq!(refs.tables, vec![table(Some("main"), "accounts", Some("a"))]);
        assert_eq!(refs.columns, vec![col(Some("accounts"), "ID")]);
    }
}
