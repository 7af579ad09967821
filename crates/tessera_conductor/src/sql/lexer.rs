//! SQL tokenizer with source-offset preservation.
//!
//! Comments are blanked in place (newlines kept) before scanning, so every
//! token's `start`/`end` always refer to offsets in the original text and
//! diagnostics can point back at what the client actually sent. Word
//! classification is context-sensitive: a word is a function only when the
//! next token opens a call and the word is a known function; a data-type
//! word counts as a keyword only in a definition or cast position.

use std::fmt;

use phf::phf_set;

/// Token categories surfaced to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Identifier,
    Function,
    Number,
    String,
    Operator,
    Punctuation,
    Placeholder,
}

/// One token. `start`/`end` are character offsets into the original text;
/// `text` holds the decoded value for string literals and the inner text
/// for quoted identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    /// Set for identifiers that were written quoted; they are exempt from
    /// keyword classification.
    pub quoted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerErrorKind {
    UnterminatedString,
    UnterminatedQuotedIdentifier,
    UnexpectedCharacter(char),
}

/// Lexing failure with a caret excerpt pointing at the offending offset.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerError {
    pub kind: TokenizerErrorKind,
    pub line: usize,
    pub column: usize,
    pub excerpt: String,
}

impl std::error::Error for TokenizerError {}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            TokenizerErrorKind::UnterminatedString => "unterminated string literal".to_string(),
            TokenizerErrorKind::UnterminatedQuotedIdentifier => {
                "unterminated quoted identifier".to_string()
            }
            TokenizerErrorKind::UnexpectedCharacter(c) => {
                format!("unexpected character '{c}'")
            }
        };
        write!(
            f,
            "{what} at line {}, column {}\n{}",
            self.line, self.column, self.excerpt
        )
    }
}

static KEYWORDS: phf::Set<&'static str> = phf_set! {
    "SELECT", "DISTINCT", "FROM", "WHERE", "GROUP", "BY", "HAVING", "ORDER",
    "LIMIT", "OFFSET", "ASC", "DESC", "JOIN", "LEFT", "RIGHT", "INNER",
    "OUTER", "ON", "AS", "INSERT", "INTO", "VALUES", "UPDATE", "SET",
    "DELETE", "RETURNING", "CREATE", "TABLE", "INDEX", "UNIQUE", "IF",
    "NOT", "EXISTS", "DROP", "ALTER", "ADD", "COLUMN", "RENAME", "TO",
    "PRAGMA", "AND", "OR", "IN", "BETWEEN", "IS", "NULL", "LIKE", "CASE",
    "WHEN", "THEN", "ELSE", "END", "PRIMARY", "KEY", "DEFAULT", "CHECK",
    "REFERENCES", "CONSTRAINT", "AUTOINCREMENT", "TRUE", "FALSE",
};

static DATA_TYPES: phf::Set<&'static str> = phf_set! {
    "INTEGER", "INT", "BIGINT", "SMALLINT", "TINYINT", "TEXT", "REAL",
    "FLOAT", "DOUBLE", "NUMERIC", "DECIMAL", "BLOB", "BOOLEAN", "VARCHAR",
    "CHAR", "DATE", "DATETIME", "TIMESTAMP",
};

static FUNCTIONS: phf::Set<&'static str> = phf_set! {
    "COUNT", "SUM", "MIN", "MAX", "AVG", "TOTAL", "GROUP_CONCAT", "ABS",
    "COALESCE", "IFNULL", "NULLIF", "LENGTH", "LOWER", "UPPER", "SUBSTR",
    "SUBSTRING", "ROUND", "TRIM", "LTRIM", "RTRIM", "REPLACE", "INSTR",
    "HEX", "TYPEOF", "RANDOM", "DATE", "TIME", "DATETIME", "STRFTIME",
    "JULIANDAY", "UNIXEPOCH", "LAST_INSERT_ROWID", "ROW_NUMBER", "RANK",
};

/// Tokenizes one statement.
pub fn tokenize(input: &str) -> Result<Vec<Token>, TokenizerError> {
    let original: Vec<char> = input.chars().collect();
    let chars = blank_comments(&original);
    let mut tokens = scan(&original, &chars)?;
    classify_words(&mut tokens);
    Ok(tokens)
}

/// Replaces `-- …` and `/* … */` comments with spaces, keeping newlines so
/// offsets and line numbers survive.
fn blank_comments(chars: &[char]) -> Vec<char> {
    let mut out = chars.to_vec();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                // Skip over quoted regions so comment markers inside
                // literals stay untouched.
                let quote = chars[i];
                let mut j = i + 1;
                while j < chars.len() {
                    if quote == '\'' && chars[j] == '\\' {
                        j += 2;
                        continue;
                    }
                    if chars[j] == quote {
                        if quote == '\'' && chars.get(j + 1) == Some(&'\'') {
                            j += 2;
                            continue;
                        }
                        break;
                    }
                    j += 1;
                }
                i = (j + 1).min(chars.len());
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    out[i] = ' ';
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        out[i] = ' ';
                        out[i + 1] = ' ';
                        i += 2;
                        closed = true;
                        break;
                    }
                    if chars[i] != '\n' {
                        out[i] = ' ';
                    }
                    i += 1;
                }
                if !closed {
                    break;
                }
            }
            _ => i += 1,
        }
    }
    out
}

fn scan(original: &[char], chars: &[char]) -> Result<Vec<Token>, TokenizerError> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' {
            let (value, end) = scan_string(original, chars, i)?;
            tokens.push(Token {
                text: value,
                kind: TokenKind::String,
                start: i,
                end,
                quoted: false,
            });
            i = end;
            continue;
        }

        if c == '"' || c == '`' {
            let (value, end) = scan_quoted_identifier(original, chars, i, c)?;
            tokens.push(Token {
                text: value,
                kind: TokenKind::Identifier,
                start: i,
                end,
                quoted: true,
            });
            i = end;
            continue;
        }

        if c.is_ascii_digit() {
            let end = scan_number(chars, i);
            tokens.push(Token {
                text: chars[i..end].iter().collect(),
                kind: TokenKind::Number,
                start: i,
                end,
                quoted: false,
            });
            i = end;
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let mut end = i + 1;
            while end < chars.len()
                && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
            {
                end += 1;
            }
            tokens.push(Token {
                text: chars[i..end].iter().collect(),
                kind: TokenKind::Identifier,
                start: i,
                end,
                quoted: false,
            });
            i = end;
            continue;
        }

        if c == '?' {
            tokens.push(Token {
                text: "?".to_string(),
                kind: TokenKind::Placeholder,
                start: i,
                end: i + 1,
                quoted: false,
            });
            i += 1;
            continue;
        }

        if let Some(op) = two_char_operator(chars, i) {
            tokens.push(Token {
                text: op.to_string(),
                kind: TokenKind::Operator,
                start: i,
                end: i + 2,
                quoted: false,
            });
            i += 2;
            continue;
        }

        if matches!(c, '=' | '<' | '>' | '+' | '-' | '*' | '/' | '.') {
            tokens.push(Token {
                text: c.to_string(),
                kind: TokenKind::Operator,
                start: i,
                end: i + 1,
                quoted: false,
            });
            i += 1;
            continue;
        }

        if matches!(c, '(' | ')' | ',' | ';') {
            tokens.push(Token {
                text: c.to_string(),
                kind: TokenKind::Punctuation,
                start: i,
                end: i + 1,
                quoted: false,
            });
            i += 1;
            continue;
        }

        return Err(error_at(
            original,
            i,
            TokenizerErrorKind::UnexpectedCharacter(c),
        ));
    }
    Ok(tokens)
}

fn two_char_operator(chars: &[char], i: usize) -> Option<&'static str> {
    let a = chars.get(i)?;
    let b = chars.get(i + 1)?;
    match (a, b) {
        ('<', '=') => Some("<="),
        ('>', '=') => Some(">="),
        ('!', '=') => Some("!="),
        ('<', '>') => Some("<>"),
        _ => None,
    }
}

/// Scans a single-quoted literal starting at `start`. Returns the decoded
/// value and the exclusive end offset. `''` collapses to `'`; backslash
/// escapes are honored.
fn scan_string(
    original: &[char],
    chars: &[char],
    start: usize,
) -> Result<(String, usize), TokenizerError> {
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                value.push(unescape(chars[i + 1]));
                i += 2;
            }
            '\'' => {
                if chars.get(i + 1) == Some(&'\'') {
                    value.push('\'');
                    i += 2;
                } else {
                    return Ok((value, i + 1));
                }
            }
            other => {
                value.push(other);
                i += 1;
            }
        }
    }
    Err(error_at(
        original,
        start,
        TokenizerErrorKind::UnterminatedString,
    ))
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

/// Scans a double-quote or backtick identifier; the inner text is kept
/// verbatim (no escape processing).
fn scan_quoted_identifier(
    original: &[char],
    chars: &[char],
    start: usize,
    quote: char,
) -> Result<(String, usize), TokenizerError> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            let value: String = chars[start + 1..i].iter().collect();
            return Ok((value, i + 1));
        }
        i += 1;
    }
    Err(error_at(
        original,
        start,
        TokenizerErrorKind::UnterminatedQuotedIdentifier,
    ))
}

/// Scans decimal, hex (`0x…`), binary (`0b…`) and scientific forms. Signs
/// are external operator tokens.
fn scan_number(chars: &[char], start: usize) -> usize {
    let mut i = start;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        while i < chars.len() && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        return i;
    }
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('b') | Some('B')) {
        i += 2;
        while i < chars.len() && matches!(chars[i], '0' | '1') {
            i += 1;
        }
        return i;
    }
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

/// Second pass: resolve unquoted words into keyword / function / identifier
/// using their neighbors.
fn classify_words(tokens: &mut [Token]) {
    for idx in 0..tokens.len() {
        if tokens[idx].kind != TokenKind::Identifier || tokens[idx].quoted {
            continue;
        }
        let upper = tokens[idx].text.to_ascii_uppercase();
        let next_is_open_paren = tokens
            .get(idx + 1)
            .is_some_and(|t| t.kind == TokenKind::Punctuation && t.text == "(");

        if next_is_open_paren && FUNCTIONS.contains(upper.as_str()) {
            tokens[idx].kind = TokenKind::Function;
            continue;
        }

        if DATA_TYPES.contains(upper.as_str()) {
            // Type position: after a column name in a definition, or after
            // AS in a cast. Anywhere else the word is an ordinary
            // identifier (or keyword, if it doubles as one).
            let prev = idx.checked_sub(1).and_then(|p| tokens.get(p));
            let in_type_position = prev.is_some_and(|t| {
                t.kind == TokenKind::Identifier
                    || (t.kind == TokenKind::Keyword && t.text.eq_ignore_ascii_case("AS"))
            });
            if in_type_position || KEYWORDS.contains(upper.as_str()) {
                tokens[idx].kind = TokenKind::Keyword;
            }
            continue;
        }

        if KEYWORDS.contains(upper.as_str()) {
            tokens[idx].kind = TokenKind::Keyword;
        }
    }
}

fn error_at(original: &[char], offset: usize, kind: TokenizerErrorKind) -> TokenizerError {
    let mut line = 1;
    let mut line_start = 0;
    for (i, c) in original.iter().enumerate().take(offset) {
        if *c == '\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    let column = offset - line_start + 1;
    let line_end = original[line_start..]
        .iter()
        .position(|c| *c == '\n')
        .map(|p| line_start + p)
        .unwrap_or(original.len());
    let source_line: String = original[line_start..line_end].iter().collect();
    let caret = format!("{}^", " ".repeat(column.saturating_sub(1)));
    TokenizerError {
        kind,
        line,
        column,
        excerpt: format!("{source_line}\n{caret}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(String, TokenKind)> {
        tokenize(sql)
            .expect("tokenize")
            .into_iter()
            .map(|t| (t.text, t.kind))
            .collect()
    }

    #[test]
    fn classifies_basic_select() {
        let tokens = kinds("SELECT id FROM users WHERE id = ?");
        assert_eq!(
            tokens,
            vec![
                ("SELECT".to_string(), TokenKind::Keyword),
                ("id".to_string(), TokenKind::Identifier),
                ("FROM".to_string(), TokenKind::Keyword),
                ("users".to_string(), TokenKind::Identifier),
                ("WHERE".to_string(), TokenKind::Keyword),
                ("id".to_string(), TokenKind::Identifier),
                ("=".to_string(), TokenKind::Operator),
                ("?".to_string(), TokenKind::Placeholder),
            ]
        );
    }

    #[test]
    fn function_needs_call_position() {
        let tokens = kinds("SELECT count(*), count FROM t");
        assert_eq!(tokens[1], ("count".to_string(), TokenKind::Function));
        // bare `count` with no opening paren is an identifier
        assert_eq!(tokens[6], ("count".to_string(), TokenKind::Identifier));
    }

    #[test]
    fn data_type_is_keyword_only_in_type_position() {
        let tokens = kinds("CREATE TABLE t (id INTEGER PRIMARY KEY, text TEXT)");
        let integer = tokens.iter().find(|t| t.0 == "INTEGER").expect("INTEGER");
        assert_eq!(integer.1, TokenKind::Keyword);
        // the column named `text` is an identifier, its type is a keyword
        assert_eq!(tokens[9], ("text".to_string(), TokenKind::Identifier));
        assert_eq!(tokens[10], ("TEXT".to_string(), TokenKind::Keyword));
    }

    #[test]
    fn comments_blank_but_offsets_survive() {
        let sql = "SELECT /* hidden */ id -- trailing\nFROM users";
        let tokens = tokenize(sql).expect("tokenize");
        let id = tokens.iter().find(|t| t.text == "id").expect("id token");
        assert_eq!(&sql[id.start..id.end], "id");
        let from = tokens.iter().find(|t| t.text == "FROM").expect("FROM");
        assert_eq!(&sql[from.start..from.end], "FROM");
    }

    #[test]
    fn strings_collapse_doubled_quotes_and_escapes() {
        let tokens = tokenize(r"SELECT 'it''s', 'a\nb'").expect("tokenize");
        assert_eq!(tokens[1].text, "it's");
        assert_eq!(tokens[3].text, "a\nb");
        assert_eq!(tokens[1].kind, TokenKind::String);
    }

    #[test]
    fn quoted_identifiers_keep_text_and_resist_keyword_classification() {
        let tokens = tokenize("SELECT \"select\", `order` FROM t").expect("tokenize");
        assert_eq!(tokens[1].text, "select");
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert!(tokens[1].quoted);
        assert_eq!(tokens[3].text, "order");
        assert_eq!(tokens[3].kind, TokenKind::Identifier);
    }

    #[test]
    fn number_forms() {
        let tokens = kinds("SELECT 42, 3.25, 0xFF, 0b101, 2e10, 1.5e-3");
        let numbers: Vec<&str> = tokens
            .iter()
            .filter(|t| t.1 == TokenKind::Number)
            .map(|t| t.0.as_str())
            .collect();
        assert_eq!(numbers, vec!["42", "3.25", "0xFF", "0b101", "2e10", "1.5e-3"]);
    }

    #[test]
    fn unterminated_string_reports_line_and_column() {
        let err = tokenize("SELECT *\nFROM t WHERE name = 'oops").expect_err("must fail");
        assert_eq!(err.kind, TokenizerErrorKind::UnterminatedString);
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 21);
        assert!(err.excerpt.contains('^'));
    }

    #[test]
    fn unterminated_identifier_is_distinguished() {
        let err = tokenize("SELECT \"broken FROM t").expect_err("must fail");
        assert_eq!(err.kind, TokenizerErrorKind::UnterminatedQuotedIdentifier);
    }
}
