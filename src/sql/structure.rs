use std::ops::Range;

use super::references::{is_reserved, TableRef};
use super::tokenizer::{tokenize, Token, TokenKind};

/// Top-level clause layout of a single `SELECT` statement.
///
/// Ranges index into `tokens` and only describe depth-0 clauses; subqueries
/// stay inside whichever clause contains them.
#[derive(Debug)]
pub struct SelectStatement<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    select_kw: usize,
    distinct: Option<usize>,
    top: Option<Range<usize>>,
    select_list: Range<usize>,
    from: Range<usize>,
    where_clause: Option<Range<usize>>,
    group_by: Option<Range<usize>>,
    order_by: Option<Range<usize>>,
    limit: Option<Range<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
}

impl<'a> SelectStatement<'a> {
    pub fn parse(sql: &'a str) -> Option<Self> {
        let tokens = tokenize(sql);
        let select_kw = tokens.iter().position(|t| t.is_keyword("select"))?;

        let mut distinct = None;
        let mut top = None;
        let mut list_start = select_kw + 1;
        if tokens.get(list_start).is_some_and(|t| t.is_keyword("distinct")) {
            distinct = Some(list_start);
            list_start += 1;
        }
        if tokens.get(list_start).is_some_and(|t| t.is_keyword("top")) {
            let end = top_clause_end(&tokens, list_start);
            top = Some(list_start..end);
            list_start = end;
        }

        // (clause, first token after its keyword(s))
        let mut marks: Vec<(Clause, usize, usize)> = vec![(Clause::Select, select_kw, list_start)];
        let mut depth = 0usize;
        for (i, tok) in tokens.iter().enumerate().skip(list_start) {
            match tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth = depth.saturating_sub(1),
                TokenKind::Semicolon if depth == 0 => {
                    marks.push((Clause::Limit, i, i));
                    break;
                }
                _ => {}
            }
            if depth != 0 || tok.kind != TokenKind::Word {
                continue;
            }
            let next_is_by = tokens.get(i + 1).is_some_and(|t| t.is_keyword("by"));
            let mark = if tok.is_keyword("from") {
                Some((Clause::From, i, i + 1))
            } else if tok.is_keyword("where") {
                Some((Clause::Where, i, i + 1))
            } else if tok.is_keyword("group") && next_is_by {
                Some((Clause::GroupBy, i, i + 2))
            } else if tok.is_keyword("having") {
                Some((Clause::Having, i, i + 1))
            } else if tok.is_keyword("order") && next_is_by {
                Some((Clause::OrderBy, i, i + 2))
            } else if tok.is_keyword("limit") || tok.is_keyword("offset") {
                Some((Clause::Limit, i, i + 1))
            } else if tok.is_keyword("union") || tok.is_keyword("except") || tok.is_keyword("intersect") {
                // compound statements are not decomposed
                return None;
            } else {
                None
            };
            if let Some(m) = mark {
                // LIMIT n OFFSET m stays one clause
                if m.0 == Clause::Limit && marks.last().is_some_and(|l| l.0 == Clause::Limit) {
                    continue;
                }
                marks.push(m);
            }
        }

        let body = |clause: Clause| -> Option<Range<usize>> {
            let idx = marks.iter().position(|m| m.0 == clause)?;
            let start = marks[idx].2;
            let end = marks.get(idx + 1).map_or(tokens.len(), |m| m.1);
            Some(start..end)
        };

        let select_list = body(Clause::Select)?;
        let from = body(Clause::From)?;
        let where_clause = body(Clause::Where);
        let group_by = body(Clause::GroupBy);
        let order_by = body(Clause::OrderBy);
        let limit = marks
            .iter()
            .find(|m| m.0 == Clause::Limit && tokens.get(m.1).is_some_and(|t| t.kind == TokenKind::Word))
            .map(|m| {
                let end = tokens
                    .iter()
                    .skip(m.1)
                    .position(|t| t.kind == TokenKind::Semicolon)
                    .map_or(tokens.len(), |p| m.1 + p);
                m.1..end
            });

        Some(Self {
            sql,
            tokens,
            select_kw,
            distinct,
            top,
            select_list,
            from,
            where_clause,
            group_by,
            order_by,
            limit,
        })
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct.is_some()
    }

    pub fn has_join(&self) -> bool {
        self.tokens[self.from.clone()].iter().any(|t| t.is_keyword("join"))
            || split_top_level(&self.tokens, self.from.clone(), |t| t.kind == TokenKind::Comma).len() > 1
    }

    pub fn has_group_by(&self) -> bool {
        self.group_by.is_some()
    }

    /// The first table in `FROM`, if it is a plain table rather than a subquery.
    pub fn primary_table(&self) -> Option<TableRef> {
        let first = self.tokens.get(self.from.start)?;
        if !first.is_identifier() || is_reserved(&first.value) {
            return None;
        }
        let refs = super::references::extract_references(&format!(
            "SELECT 1 FROM {}",
            self.text(self.from.clone())
        ));
        refs.tables.into_iter().next()
    }

    /// Source text of the `TOP` clause, e.g. `TOP 10` or `TOP (5) PERCENT`.
    pub fn top_text(&self) -> Option<&'a str> {
        self.top.clone().map(|r| self.span(r))
    }

    /// Source text after `LIMIT`/`OFFSET`, keyword included.
    pub fn limit_text(&self) -> Option<&'a str> {
        self.limit.clone().map(|r| self.span(r))
    }

    pub fn select_items(&self) -> Vec<Range<usize>> {
        split_top_level(&self.tokens, self.select_list.clone(), |t| t.kind == TokenKind::Comma)
    }

    /// `WHERE` conjuncts split on top-level `AND`, ignoring `BETWEEN x AND y`.
    pub fn where_conditions(&self) -> Vec<Range<usize>> {
        let Some(range) = self.where_clause.clone() else {
            return Vec::new();
        };
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut start = range.start;
        let mut in_between = false;
        for i in range.clone() {
            let tok = &self.tokens[i];
            match tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth = depth.saturating_sub(1),
                _ => {}
            }
            if depth != 0 {
                continue;
            }
            if tok.is_keyword("between") {
                in_between = true;
            } else if tok.is_keyword("and") {
                if in_between {
                    in_between = false;
                } else {
                    if i > start {
                        parts.push(start..i);
                    }
                    start = i + 1;
                }
            }
        }
        if range.end > start {
            parts.push(start..range.end);
        }
        parts
    }

    pub fn order_items(&self) -> Vec<Range<usize>> {
        self.order_by
            .clone()
            .map(|r| split_top_level(&self.tokens, r, |t| t.kind == TokenKind::Comma))
            .unwrap_or_default()
    }

    /// Qualifiers (`x` in `x.col`) used inside a token range.
    pub fn qualifiers_in(&self, range: Range<usize>) -> Vec<String> {
        let mut out = Vec::new();
        for i in range.clone() {
            let tok = &self.tokens[i];
            let followed_by_dot = self
                .tokens
                .get(i + 1)
                .is_some_and(|t| t.kind == TokenKind::Dot && i + 1 < range.end);
            let preceded_by_dot = i > range.start && self.tokens[i - 1].kind == TokenKind::Dot;
            if tok.is_identifier() && followed_by_dot && !preceded_by_dot {
                out.push(tok.value.clone());
            }
        }
        out
    }

    /// Unqualified names used as columns inside a token range.
    ///
    /// Skips keywords, function names, `::` cast targets, the `x` in `x.col`
    /// and aliases (after `AS` or directly after an expression).
    pub fn bare_names_in(&self, range: Range<usize>) -> Vec<String> {
        range
            .clone()
            .filter(|&i| {
                let tok = &self.tokens[i];
                tok.is_identifier()
                    && !(tok.kind == TokenKind::Word && is_reserved(&tok.value))
                    && !self.is_alias(i, &range)
                    && !self.tokens.get(i + 1).is_some_and(|t| {
                        t.kind == TokenKind::Dot || t.kind == TokenKind::LParen
                    })
                    && !(i > range.start
                        && (self.tokens[i - 1].kind == TokenKind::Dot
                            || (self.tokens[i - 1].kind == TokenKind::Operator
                                && self.tokens[i - 1].value == "::")))
            })
            .map(|i| self.tokens[i].value.clone())
            .collect()
    }

    /// Output aliases declared inside a token range.
    pub fn aliases_in(&self, range: Range<usize>) -> Vec<String> {
        range
            .clone()
            .filter(|&i| self.tokens[i].is_identifier() && self.is_alias(i, &range))
            .map(|i| self.tokens[i].value.clone())
            .collect()
    }

    fn is_alias(&self, i: usize, range: &Range<usize>) -> bool {
        if i == range.start {
            return false;
        }
        let tok = &self.tokens[i];
        if tok.kind == TokenKind::Word && is_reserved(&tok.value) {
            return false;
        }
        let prev = &self.tokens[i - 1];
        prev.is_keyword("as")
            || prev.is_keyword("end")
            || matches!(
                prev.kind,
                TokenKind::RParen | TokenKind::Number | TokenKind::Str | TokenKind::QuotedIdent
            )
            || (prev.kind == TokenKind::Word && !is_reserved(&prev.value))
    }

    pub fn text(&self, range: Range<usize>) -> &'a str {
        self.span(range)
    }

    /// Source text of a range with every `qualifier.` prefix that names `table` removed.
    pub fn text_without_prefix(&self, range: Range<usize>, table: &TableRef) -> String {
        let mut out = String::new();
        let mut prev_end = self.tokens.get(range.start).map_or(0, |t| t.start);
        let mut pending_gap: Option<&str> = None;
        let mut i = range.start;
        while i < range.end {
            let tok = &self.tokens[i];
            let gap = &self.sql[prev_end..tok.start];
            let is_prefix = tok.is_identifier()
                && table.answers_to(&tok.value)
                && self.tokens.get(i + 1).is_some_and(|t| t.kind == TokenKind::Dot)
                && !(i > range.start && self.tokens[i - 1].kind == TokenKind::Dot);
            if is_prefix {
                pending_gap.get_or_insert(gap);
                prev_end = self.tokens[i + 1].end;
                i += 2;
                continue;
            }
            out.push_str(pending_gap.take().unwrap_or(gap));
            out.push_str(tok.text(self.sql));
            prev_end = tok.end;
            i += 1;
        }
        out.trim().to_string()
    }

    /// Byte offset right after `SELECT` or `SELECT DISTINCT`.
    pub fn modifier_insert_offset(&self) -> usize {
        let idx = self.distinct.unwrap_or(self.select_kw);
        self.tokens[idx].end
    }

    /// Byte span of an existing `TOP` clause.
    pub fn top_span(&self) -> Option<Range<usize>> {
        self.top
            .clone()
            .map(|r| self.tokens[r.start].start..self.tokens[r.end - 1].end)
    }

    fn span(&self, range: Range<usize>) -> &'a str {
        if range.is_empty() {
            return "";
        }
        let start = self.tokens[range.start].start;
        let end = self.tokens[range.end - 1].end;
        &self.sql[start..end]
    }
}

/// `TOP n`, `TOP (n)`, optionally followed by `PERCENT` / `WITH TIES`.
fn top_clause_end(tokens: &[Token], top_idx: usize) -> usize {
    let mut i = top_idx + 1;
    if tokens.get(i).is_some_and(|t| t.kind == TokenKind::LParen) {
        while i < tokens.len() && tokens[i].kind != TokenKind::RParen {
            i += 1;
        }
        i += 1;
    } else if tokens.get(i).is_some_and(|t| t.kind == TokenKind::Number) {
        i += 1;
    }
    if tokens.get(i).is_some_and(|t| t.is_keyword("percent")) {
        i += 1;
    }
    if tokens.get(i).is_some_and(|t| t.is_keyword("with"))
        && tokens.get(i + 1).is_some_and(|t| t.is_keyword("ties"))
    {
        i += 2;
    }
    i.min(tokens.len())
}

fn split_top_level(
    tokens: &[Token],
    range: Range<usize>,
    is_separator: impl Fn(&Token) -> bool,
) -> Vec<Range<usize>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = range.start;
    for i in range.clone() {
        let tok = &tokens[i];
        match tok.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0 && is_separator(tok) {
            if i > start {
                parts.push(start..i);
            }
            start = i + 1;
        }
    }
    if range.end > start {
        parts.push(start..range.end);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOINED: &str = "SELECT DISTINCT a.ACCT_ID, c.NAME, a.BALANCE \
        FROM accounts a JOIN customers c ON a.CUST_ID = c.CUST_ID \
        WHERE a.STATUS = 'OPEN' AND c.SEGMENT = 'VIP' AND a.OPEN_DT BETWEEN '2024-01-01' AND '2024-06-30' \
        ORDER BY a.OPEN_DT DESC, c.NAME \
        LIMIT 50";

    #[test]
    fn splits_clauses_of_a_join() {
        let stmt = SelectStatement::parse(JOINED).unwrap();
        assert!(stmt.is_distinct());
        assert!(stmt.has_join());
        assert_eq!(stmt.select_items().len(), 3);

        let conditions: Vec<&str> = stmt.where_conditions().into_iter().map(|r| stmt.text(r)).collect();
        assert_eq!(
            conditions,
            vec![
                "a.STATUS = 'OPEN'",
                "c.SEGMENT = 'VIP'",
                "a.OPEN_DT BETWEEN '2024-01-01' AND '2024-06-30'"
            ]
        );
        assert_eq!(stmt.order_items().len(), 2);
        assert_eq!(stmt.limit_text(), Some("LIMIT 50"));

        let primary = stmt.primary_table().unwrap();
        assert_eq!(primary.name, "accounts");
        assert_eq!(primary.alias.as_deref(), Some("a"));
    }

    #[test]
    fn strips_primary_prefixes_only() {
        let stmt = SelectStatement::parse(JOINED).unwrap();
        let primary = stmt.primary_table().unwrap();
        let first_condition = stmt.where_conditions()[0].clone();
        assert_eq!(stmt.text_without_prefix(first_condition, &primary), "STATUS = 'OPEN'");
        let second = stmt.where_conditions()[1].clone();
        assert_eq!(stmt.qualifiers_in(second), vec!["c".to_string()]);
    }

    #[test]
    fn bare_names_skip_calls_casts_and_aliases() {
        let stmt = SelectStatement::parse(
            "SELECT a.BAL AS total, UPPER(NAME) nm FROM accounts a JOIN customers c ON a.CUST_ID = c.CUST_ID \
             WHERE SEGMENT = 'VIP' AND OPEN_DT::DATE > now() - INTERVAL 3 DAYS ORDER BY total",
        )
        .unwrap();
        let items = stmt.select_items();
        assert!(stmt.bare_names_in(items[0].clone()).is_empty());
        assert_eq!(stmt.aliases_in(items[0].clone()), vec!["total".to_string()]);
        assert_eq!(stmt.bare_names_in(items[1].clone()), vec!["NAME".to_string()]);
        assert_eq!(stmt.aliases_in(items[1].clone()), vec!["nm".to_string()]);

        let names: Vec<Vec<String>> = stmt
            .where_conditions()
            .into_iter()
            .map(|r| stmt.bare_names_in(r))
            .collect();
        assert_eq!(names, vec![vec!["SEGMENT".to_string()], vec!["OPEN_DT".to_string()]]);
    }

    #[test]
    fn finds_top_clause_after_distinct() {
        let stmt = SelectStatement::parse("SELECT DISTINCT TOP (10) NAME FROM customers").unwrap();
        assert_eq!(stmt.top_text(), Some("TOP (10)"));
        assert_eq!(stmt.select_items().len(), 1);
        assert_eq!(stmt.modifier_insert_offset(), "SELECT DISTINCT".len());
    }

    #[test]
    fn subqueries_stay_inside_their_clause() {
        let stmt = SelectStatement::parse(
            "SELECT ID FROM accounts WHERE CUST_ID IN (SELECT CUST_ID FROM customers WHERE X = 1) AND STATUS = 'A'",
        )
        .unwrap();
        assert!(!stmt.has_join());
        assert_eq!(stmt.where_conditions().len(), 2);
    }
}
