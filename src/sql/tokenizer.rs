//! Lexer for the read-only SQL subset produced by the generator.
//!
//! Tokens keep their byte span so callers can slice fragments of the original
//! statement back out without re-printing it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword.
    Word,
    /// `"name"` or `[name]`.
    QuotedIdent,
    Number,
    Str,
    Dot,
    Comma,
    LParen,
    RParen,
    Semicolon,
    Star,
    Operator,
    /// Backtick and anything else we have no use for.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    /// Identifier value with quoting removed; raw text for everything else.
    pub value: String,
}

impl Token {
    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }

    /// Case-insensitive keyword test. Quoted identifiers are never keywords.
    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Word && self.value.eq_ignore_ascii_case(kw)
    }

    pub fn text<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.start..self.end]
    }
}

pub fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // -- line comment
        if c == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        /* block comment */
        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            continue;
        }

        let start = i;
        let kind = match c {
            b'\'' => {
                i = scan_quoted(bytes, i, b'\'');
                TokenKind::Str
            }
            b'"' => {
                i = scan_quoted(bytes, i, b'"');
                TokenKind::QuotedIdent
            }
            b'[' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
                TokenKind::QuotedIdent
            }
            b'.' if bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit()) => {
                i = scan_number(bytes, i);
                TokenKind::Number
            }
            b'0'..=b'9' => {
                i = scan_number(bytes, i);
                TokenKind::Number
            }
            b'.' => {
                i += 1;
                TokenKind::Dot
            }
            b',' => {
                i += 1;
                TokenKind::Comma
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b';' => {
                i += 1;
                TokenKind::Semicolon
            }
            b'*' => {
                i += 1;
                TokenKind::Star
            }
            b':' if bytes.get(i + 1) == Some(&b':') => {
                i += 2;
                TokenKind::Operator
            }
            b'<' | b'>' | b'=' | b'!' | b'+' | b'-' | b'/' | b'%' | b'|' => {
                i += 1;
                while i < bytes.len() && matches!(bytes[i], b'<' | b'>' | b'=' | b'|') {
                    i += 1;
                }
                TokenKind::Operator
            }
            _ if is_word_byte(c) => {
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            _ => {
                // step over a whole UTF-8 character
                i += sql[i..].chars().next().map_or(1, |ch| ch.len_utf8());
                TokenKind::Other
            }
        };

        let raw = &sql[start..i];
        let value = match kind {
            TokenKind::QuotedIdent => unquote(raw),
            _ => raw.to_string(),
        };
        tokens.push(Token {
            kind,
            start,
            end: i,
            value,
        });
    }

    tokens
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'@' || b == b'#' || b == b'$' || b >= 0x80
}

fn scan_quoted(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    i += 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // doubled quote is an escape
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    i
}

fn unquote(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')))
        .unwrap_or(raw);
    inner.replace("\"\"", "\"")
}
