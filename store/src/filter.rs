//! A small WHERE-clause subset for listing filters.
//!
//! Sufficient for strings like `pk > 1`, `label LIKE 'foo%'` or
//! `state IN ('playing', 'paused')`, with comparisons joined by AND/OR.
//! The parser is a hand-written recursive descent producing typed
//! [`Comparison`] nodes; the SQLite layer renders them to parameterized SQL
//! after resolving columns against the queried entity.

use std::fmt;

/// Raised when a filter string cannot be parsed or resolved.
///
/// `user` is the message shown to the user, `detail` the technical cause.
#[derive(Debug, thiserror::Error)]
#[error("{user}: {filter_string:?}")]
pub struct FilterStringError {
    pub filter_string: String,
    pub user: String,
    pub detail: String,
}

impl FilterStringError {
    pub fn new(filter_string: impl Into<String>, user: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            filter_string: filter_string.into(),
            user: user.into(),
            detail: detail.into(),
        }
    }

    fn unreadable(filter_string: &str, detail: impl Into<String>) -> Self {
        Self::new(filter_string, "Could not be read", detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Like,
    NotLike,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::In => "IN",
            CompareOp::NotIn => "NOT IN",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    List(Vec<FilterValue>),
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Str(v.to_string())
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub fn sql(&self) -> &'static str {
        match self {
            BoolOp::And => "AND",
            BoolOp::Or => "OR",
        }
    }
}

/// One `column op value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub op: CompareOp,
    pub value: FilterValue,
}

/// A chain of comparisons joined left-associatively by AND/OR.
#[derive(Debug, Clone)]
pub struct Filter {
    raw: String,
    pub first: Comparison,
    pub rest: Vec<(BoolOp, Comparison)>,
}

impl Filter {
    /// Parse a filter string; empty input is no filter at all.
    pub fn parse(input: &str) -> Result<Option<Filter>, FilterStringError> {
        if input.trim().is_empty() {
            return Ok(None);
        }
        Parser::new(input)?.parse().map(Some)
    }

    /// The original filter string, for error reporting.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Build an equality filter programmatically.
    pub fn eq(column: &str, value: impl Into<FilterValue>) -> Filter {
        let value = value.into();
        Filter {
            raw: format!("{column} == ..."),
            first: Comparison {
                column: column.to_string(),
                op: CompareOp::Eq,
                value,
            },
            rest: Vec::new(),
        }
    }

    pub fn and(mut self, column: &str, op: CompareOp, value: impl Into<FilterValue>) -> Filter {
        self.rest.push((
            BoolOp::And,
            Comparison {
                column: column.to_string(),
                op,
                value: value.into(),
            },
        ));
        self
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Keyword(Keyword),
    Int(i64),
    Float(f64),
    Str(String),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    And,
    Or,
    In,
    Not,
    Like,
    Null,
    True,
    False,
}

fn keyword(ident: &str) -> Option<Keyword> {
    match ident.to_ascii_uppercase().as_str() {
        "AND" => Some(Keyword::And),
        "OR" => Some(Keyword::Or),
        "IN" => Some(Keyword::In),
        "NOT" => Some(Keyword::Not),
        "LIKE" => Some(Keyword::Like),
        "NULL" => Some(Keyword::Null),
        "TRUE" => Some(Keyword::True),
        "FALSE" => Some(Keyword::False),
        _ => None,
    }
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, FilterStringError> {
        Ok(Self {
            input,
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, user: &str, detail: impl Into<String>) -> FilterStringError {
        FilterStringError::new(self.input, user, detail)
    }

    fn parse(mut self) -> Result<Filter, FilterStringError> {
        let first = self.parse_comparison()?;
        let mut rest = Vec::new();
        while let Some(token) = self.next() {
            let op = match token {
                Token::Keyword(Keyword::And) => BoolOp::And,
                Token::Keyword(Keyword::Or) => BoolOp::Or,
                other => {
                    return Err(self.error(
                        "Comparisons must be joined by AND or OR",
                        format!("unexpected token {other:?}"),
                    ))
                }
            };
            rest.push((op, self.parse_comparison()?));
        }
        Ok(Filter {
            raw: self.input.to_string(),
            first,
            rest,
        })
    }

    fn parse_comparison(&mut self) -> Result<Comparison, FilterStringError> {
        let column = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(other) => {
                return Err(self.error(
                    "Left comparators must be columns",
                    format!("expected a column name, got {other:?}"),
                ))
            }
            None => {
                return Err(FilterStringError::unreadable(
                    self.input,
                    "expected a column name, got end of input",
                ))
            }
        };
        if matches!(self.peek(), Some(Token::Dot)) {
            return Err(self.error(
                &format!("Unknown table: {column}"),
                "joined-table references are not supported",
            ));
        }

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            Some(Token::Keyword(Keyword::In)) => CompareOp::In,
            Some(Token::Keyword(Keyword::Like)) => CompareOp::Like,
            Some(Token::Keyword(Keyword::Not)) => match self.next() {
                Some(Token::Keyword(Keyword::In)) => CompareOp::NotIn,
                Some(Token::Keyword(Keyword::Like)) => CompareOp::NotLike,
                other => {
                    return Err(self.error(
                        "Unknown comparator: NOT",
                        format!("NOT must be followed by IN or LIKE, got {other:?}"),
                    ))
                }
            },
            other => {
                return Err(self.error(
                    "Unknown comparator",
                    format!("expected a comparison operator, got {other:?}"),
                ))
            }
        };

        let value = if matches!(op, CompareOp::In | CompareOp::NotIn) {
            self.parse_list()?
        } else {
            self.parse_scalar()?
        };

        Ok(Comparison { column, op, value })
    }

    fn parse_scalar(&mut self) -> Result<FilterValue, FilterStringError> {
        match self.next() {
            Some(Token::Int(v)) => Ok(FilterValue::Int(v)),
            Some(Token::Float(v)) => Ok(FilterValue::Float(v)),
            Some(Token::Str(v)) => Ok(FilterValue::Str(v)),
            Some(Token::Keyword(Keyword::Null)) => Ok(FilterValue::Null),
            Some(Token::Keyword(Keyword::True)) => Ok(FilterValue::Bool(true)),
            Some(Token::Keyword(Keyword::False)) => Ok(FilterValue::Bool(false)),
            Some(Token::Ident(name)) => Err(self.error(
                "unknown right comparison",
                format!("got a column for right comparison: {name}"),
            )),
            other => Err(FilterStringError::unreadable(
                self.input,
                format!("expected a value, got {other:?}"),
            )),
        }
    }

    fn parse_list(&mut self) -> Result<FilterValue, FilterStringError> {
        match self.next() {
            Some(Token::LParen) => {}
            other => {
                return Err(self.error(
                    "IN requires a parenthesized list",
                    format!("expected '(', got {other:?}"),
                ))
            }
        }
        let mut values = vec![self.parse_scalar()?];
        loop {
            match self.next() {
                Some(Token::Comma) => values.push(self.parse_scalar()?),
                Some(Token::RParen) => break,
                other => {
                    return Err(self.error(
                        "IN requires a parenthesized list",
                        format!("expected ',' or ')', got {other:?}"),
                    ))
                }
            }
        }
        Ok(FilterValue::List(values))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterStringError> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if bytes.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Gt));
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CompareOp::Lt));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        // '' escapes a quote inside the literal
                        Some('\'') if bytes.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            value.push(c);
                            i += 1;
                        }
                        None => {
                            return Err(FilterStringError::unreadable(
                                input,
                                "unterminated string literal",
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                let mut is_float = false;
                while let Some(&c) = bytes.get(i) {
                    if c.is_ascii_digit() {
                        i += 1;
                    } else if c == '.' && !is_float {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = bytes[start..i].iter().collect();
                let token = if is_float {
                    text.parse::<f64>().map(Token::Float).map_err(|e| e.to_string())
                } else {
                    text.parse::<i64>().map(Token::Int).map_err(|e| e.to_string())
                };
                tokens.push(token.map_err(|_| {
                    FilterStringError::unreadable(input, format!("bad number literal {text:?}"))
                })?);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while let Some(&c) = bytes.get(i) {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = bytes[start..i].iter().collect();
                match keyword(&text) {
                    Some(kw) => tokens.push(Token::Keyword(kw)),
                    // columns are matched case-insensitively, lowercase here
                    None => tokens.push(Token::Ident(text.to_ascii_lowercase())),
                }
            }
            other => {
                return Err(FilterStringError::unreadable(
                    input,
                    format!("unexpected character {other:?}"),
                ))
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_comparison() {
        let filter = Filter::parse("pk > 1").unwrap().unwrap();
        assert_eq!(
            filter.first,
            Comparison {
                column: "pk".into(),
                op: CompareOp::Gt,
                value: FilterValue::Int(1),
            }
        );
        assert!(filter.rest.is_empty());
    }

    #[test]
    fn parses_and_chain() {
        let filter = Filter::parse("pk > 0 AND label LIKE 'a%'").unwrap().unwrap();
        assert_eq!(filter.rest.len(), 1);
        let (op, comp) = &filter.rest[0];
        assert_eq!(*op, BoolOp::And);
        assert_eq!(comp.op, CompareOp::Like);
        assert_eq!(comp.value, FilterValue::Str("a%".into()));
    }

    #[test]
    fn parses_in_list() {
        let filter = Filter::parse("state IN ('playing', 'paused')")
            .unwrap()
            .unwrap();
        assert_eq!(filter.first.op, CompareOp::In);
        assert_eq!(
            filter.first.value,
            FilterValue::List(vec![
                FilterValue::Str("playing".into()),
                FilterValue::Str("paused".into()),
            ])
        );
    }

    #[test]
    fn parses_not_in_and_not_like() {
        let filter = Filter::parse("label NOT IN ('a') OR label NOT LIKE 'b%'")
            .unwrap()
            .unwrap();
        assert_eq!(filter.first.op, CompareOp::NotIn);
        assert_eq!(filter.rest[0].1.op, CompareOp::NotLike);
        assert_eq!(filter.rest[0].0, BoolOp::Or);
    }

    #[test]
    fn programmatic_filters_mirror_parsed_ones() {
        let built = Filter::eq("state", "playing").and("pk", CompareOp::Gt, 0);
        let parsed = Filter::parse("state == 'playing' AND pk > 0")
            .unwrap()
            .unwrap();
        assert_eq!(built.first, parsed.first);
        assert_eq!(built.rest.len(), parsed.rest.len());
        assert_eq!(built.rest[0].1, parsed.rest[0].1);
    }

    #[test]
    fn empty_string_is_no_filter() {
        assert!(Filter::parse("   ").unwrap().is_none());
    }

    #[test]
    fn rejects_joined_tables() {
        let err = Filter::parse("status.state == 'playing'").unwrap_err();
        assert!(err.user.starts_with("Unknown table"), "{err}");
    }

    #[test]
    fn rejects_column_on_the_right() {
        let err = Filter::parse("label == other").unwrap_err();
        assert_eq!(err.user, "unknown right comparison");
    }

    #[test]
    fn rejects_bare_equals() {
        assert!(Filter::parse("pk = 1").is_err());
    }

    #[test]
    fn quoted_quote_is_unescaped() {
        let filter = Filter::parse("label == 'it''s'").unwrap().unwrap();
        assert_eq!(filter.first.value, FilterValue::Str("it's".into()));
    }
}
