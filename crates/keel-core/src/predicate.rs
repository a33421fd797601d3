//! Gating predicates and the run context they are evaluated against.
//!
//! A predicate is parsed once, when the configuration is resolved. Parsing
//! rejects syntax errors, invalid regular expressions and fields that are not
//! part of the run context vocabulary, so evaluation itself is total: it
//! never fails, and a field missing from a particular context reads as `null`.
//!
//! Supported syntax:
//! - literals: `true`, `false`, `null`, integers, `"strings"` / `'strings'`
//! - context fields: `build.pull_request.repository.fork`
//! - `!`, `&&`, `||`, parentheses
//! - `==`, `!=` (loose across scalar kinds: `"true" == true`)
//! - `=~`, `!~` against `/regex/` literals

use crate::{Error, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Context fields a predicate may reference.
pub const KNOWN_FIELDS: &[&str] = &[
    "build.id",
    "build.number",
    "build.branch",
    "build.tag",
    "build.commit",
    "build.message",
    "build.source",
    "build.pull_request.id",
    "build.pull_request.base_branch",
    "build.pull_request.draft",
    "build.pull_request.repository",
    "build.pull_request.repository.fork",
    "pipeline.slug",
    "pipeline.default_branch",
];

/// Scalar value of a context field or literal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

static NULL: Value = Value::Null;

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Equality across scalar kinds, comparing textual forms when kinds differ.
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (a, b) => a.as_text() == b.as_text(),
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Str(s) => Some(s.clone()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Immutable snapshot of what triggered a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunContext {
    fields: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Field value, `null` when absent.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Context for a pull request, from a fork or not.
    pub fn pull_request(id: i64, from_fork: bool) -> Self {
        Self::new()
            .with("build.source", "webhook")
            .with("build.pull_request.id", id)
            .with("build.pull_request.repository.fork", from_fork)
    }

    /// Names of fields set here that predicates cannot reference.
    pub fn unknown_fields(&self) -> Vec<&str> {
        self.fields
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_FIELDS.contains(k))
            .collect()
    }
}

/// A compiled `/regex/` literal.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    fn new(source: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            source: source.to_string(),
            regex: Regex::new(source)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

/// Parsed predicate expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    Literal { value: Value },
    Field { path: String },
    Not { operand: Box<Expr> },
    And { left: Box<Expr>, right: Box<Expr> },
    Or { left: Box<Expr>, right: Box<Expr> },
    Eq { left: Box<Expr>, right: Box<Expr> },
    Ne { left: Box<Expr>, right: Box<Expr> },
    Matches { operand: Box<Expr>, pattern: Pattern },
    NotMatches { operand: Box<Expr>, pattern: Pattern },
}

/// A stage's gating condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    #[default]
    Always,
    Expression { source: String, expr: Expr },
}

impl Predicate {
    /// Parse and validate an expression.
    pub fn parse(source: &str) -> Result<Self> {
        let fail = |reason: String| Error::Predicate {
            expression: source.to_string(),
            reason,
        };

        let tokens = tokenize(source).map_err(fail)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(fail)?;
        if let Some(token) = parser.peek() {
            return Err(fail(format!("unexpected {token}")));
        }

        Ok(Predicate::Expression {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// Parse an optional expression, treating `None` and blank text as always-run.
    pub fn parse_optional(source: Option<&str>) -> Result<Self> {
        match source.map(str::trim) {
            None | Some("") => Ok(Predicate::Always),
            Some(text) => Self::parse(text),
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            Predicate::Always => None,
            Predicate::Expression { source, .. } => Some(source),
        }
    }

    pub fn evaluate(&self, context: &RunContext) -> bool {
        evaluate(self, context)
    }
}

/// Decide whether a stage gated by `predicate` runs under `context`.
pub fn evaluate(predicate: &Predicate, context: &RunContext) -> bool {
    match predicate {
        Predicate::Always => true,
        Predicate::Expression { expr, .. } => eval(expr, context).is_truthy(),
    }
}

fn eval(expr: &Expr, context: &RunContext) -> Value {
    match expr {
        Expr::Literal { value } => value.clone(),
        Expr::Field { path } => context.get(path).clone(),
        Expr::Not { operand } => Value::Bool(!eval(operand, context).is_truthy()),
        Expr::And { left, right } => {
            Value::Bool(eval(left, context).is_truthy() && eval(right, context).is_truthy())
        }
        Expr::Or { left, right } => {
            Value::Bool(eval(left, context).is_truthy() || eval(right, context).is_truthy())
        }
        Expr::Eq { left, right } => Value::Bool(eval(left, context).loosely_eq(&eval(right, context))),
        Expr::Ne { left, right } => {
            Value::Bool(!eval(left, context).loosely_eq(&eval(right, context)))
        }
        Expr::Matches { operand, pattern } => Value::Bool(is_match(&eval(operand, context), pattern)),
        Expr::NotMatches { operand, pattern } => {
            Value::Bool(!is_match(&eval(operand, context), pattern))
        }
    }
}

fn is_match(value: &Value, pattern: &Pattern) -> bool {
    value
        .as_text()
        .is_some_and(|text| pattern.regex.is_match(&text))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Regex(String),
    Not,
    And,
    Or,
    Eq,
    Ne,
    Match,
    NotMatch,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "`{s}`"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Int(i) => write!(f, "integer {i}"),
            Token::Regex(r) => write!(f, "regex /{r}/"),
            Token::Not => f.write_str("`!`"),
            Token::And => f.write_str("`&&`"),
            Token::Or => f.write_str("`||`"),
            Token::Eq => f.write_str("`==`"),
            Token::Ne => f.write_str("`!=`"),
            Token::Match => f.write_str("`=~`"),
            Token::NotMatch => f.write_str("`!~`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
        }
    }
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' if next == Some('~') => {
                tokens.push(Token::NotMatch);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '"' | '\'' => {
                let (text, end) = read_delimited(&chars, i, c)?;
                tokens.push(Token::Str(text));
                i = end;
            }
            '/' => {
                let (text, end) = read_delimited(&chars, i, '/')?;
                tokens.push(Token::Regex(text));
                i = end;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| format!("integer out of range: {text}"))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if ident.ends_with('.') || ident.contains("..") {
                    return Err(format!("malformed field path `{ident}`"));
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character `{other}` at offset {i}")),
        }
    }

    Ok(tokens)
}

/// Read a `delim`-terminated literal starting at `start`, honouring `\` escapes.
fn read_delimited(
    chars: &[char],
    start: usize,
    delim: char,
) -> std::result::Result<(String, usize), String> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                let escaped = chars[i + 1];
                // Regex escapes other than the delimiter pass through untouched.
                if delim == '/' && escaped != '/' {
                    text.push('\\');
                }
                text.push(escaped);
                i += 2;
            }
            c if c == delim => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(format!("unterminated literal starting at offset {start}"))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> ParseResult {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult {
        let mut left = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let right = self.parse_comparison()?;
            left = Expr::And {
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> ParseResult {
        let left = self.parse_unary()?;
        match self.peek() {
            Some(Token::Eq) | Some(Token::Ne) => {
                let negate = self.advance() == Some(Token::Ne);
                let right = self.parse_unary()?;
                let (left, right) = (Box::new(left), Box::new(right));
                Ok(if negate {
                    Expr::Ne { left, right }
                } else {
                    Expr::Eq { left, right }
                })
            }
            Some(Token::Match) | Some(Token::NotMatch) => {
                let negate = self.advance() == Some(Token::NotMatch);
                let pattern = match self.advance() {
                    Some(Token::Regex(source)) => Pattern::new(&source)
                        .map_err(|e| format!("invalid regex /{source}/: {e}"))?,
                    Some(other) => return Err(format!("expected a /regex/ literal, found {other}")),
                    None => return Err("expected a /regex/ literal".to_string()),
                };
                let operand = Box::new(left);
                Ok(if negate {
                    Expr::NotMatches { operand, pattern }
                } else {
                    Expr::Matches { operand, pattern }
                })
            }
            _ => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> ParseResult {
        if self.eat(&Token::Not) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Not {
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err("missing closing `)`".to_string());
                }
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal { value: Value::Str(s) }),
            Some(Token::Int(i)) => Ok(Expr::Literal { value: Value::Int(i) }),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Literal { value: Value::Bool(true) }),
                "false" => Ok(Expr::Literal { value: Value::Bool(false) }),
                "null" => Ok(Expr::Literal { value: Value::Null }),
                path if KNOWN_FIELDS.contains(&path) => Ok(Expr::Field {
                    path: path.to_string(),
                }),
                path => Err(format!("unknown context field `{path}`")),
            },
            Some(other) => Err(format!("unexpected {other}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOT_A_FORK: &str = "build.pull_request.repository.fork != true";

    #[test]
    fn test_fork_predicate() {
        let predicate = Predicate::parse(NOT_A_FORK).unwrap();

        assert!(predicate.evaluate(&RunContext::pull_request(7, false)));
        assert!(!predicate.evaluate(&RunContext::pull_request(7, true)));
        // Branch builds carry no pull request fields at all.
        assert!(predicate.evaluate(&RunContext::new().with("build.branch", "master")));
    }

    #[test]
    fn test_always_runs() {
        assert!(evaluate(&Predicate::Always, &RunContext::new()));
        assert_eq!(Predicate::parse_optional(None).unwrap(), Predicate::Always);
        assert_eq!(Predicate::parse_optional(Some("  ")).unwrap(), Predicate::Always);
    }

    #[test]
    fn test_precedence() {
        let ctx = RunContext::new()
            .with("build.branch", "master")
            .with("build.tag", "v1.0.0");

        let p = Predicate::parse(r#"build.branch == "dev" || build.branch == "master" && build.tag != null"#)
            .unwrap();
        assert!(p.evaluate(&ctx));

        let p = Predicate::parse(r#"(build.branch == "dev" || build.branch == "master") && !build.tag"#)
            .unwrap();
        assert!(!p.evaluate(&ctx));
    }

    #[test]
    fn test_loose_equality() {
        let ctx = RunContext::new()
            .with("build.pull_request.repository.fork", "true")
            .with("build.pull_request.id", "42");

        assert!(Predicate::parse("build.pull_request.repository.fork == true").unwrap().evaluate(&ctx));
        assert!(Predicate::parse("build.pull_request.id == 42").unwrap().evaluate(&ctx));
        assert!(!Predicate::parse("build.pull_request.id == null").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_regex_match() {
        let ctx = RunContext::new().with("build.branch", "release/1.2");
        assert!(Predicate::parse(r"build.branch =~ /^release\/\d+/").unwrap().evaluate(&ctx));
        assert!(!Predicate::parse(r"build.branch !~ /^release/").unwrap().evaluate(&ctx));
        // Missing fields never match.
        assert!(!Predicate::parse("build.tag =~ /.*/").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_truthiness() {
        let ctx = RunContext::new().with("build.tag", "").with("build.number", 3i64);
        assert!(!Predicate::parse("build.tag").unwrap().evaluate(&ctx));
        assert!(Predicate::parse("build.number").unwrap().evaluate(&ctx));
        assert!(Predicate::parse("!build.branch").unwrap().evaluate(&ctx));
    }

    #[test]
    fn test_malformed_predicates_are_rejected() {
        for source in [
            "build.branch ==",
            "build.branch = \"x\"",
            "(build.branch == \"x\"",
            "build.nonsense == true",
            "build.branch =~ \"x\"",
            "build.branch =~ /(/",
            "\"unterminated",
            "build.branch == \"a\" build.tag",
            "build..branch",
        ] {
            let err = Predicate::parse(source).unwrap_err();
            assert!(err.is_configuration(), "{source}: {err}");
        }
    }

    #[test]
    fn test_unknown_context_fields() {
        let ctx = RunContext::new()
            .with("build.branch", "main")
            .with("build.flavour", "vanilla");
        assert_eq!(ctx.unknown_fields(), vec!["build.flavour"]);
    }

    #[test]
    fn test_context_from_json() {
        let ctx: RunContext = serde_json::from_str(
            r#"{"build.branch": "main", "build.pull_request.repository.fork": true, "build.number": 12}"#,
        )
        .unwrap();
        assert_eq!(ctx.get("build.branch"), &Value::from("main"));
        assert_eq!(ctx.get("build.pull_request.repository.fork"), &Value::Bool(true));
        assert_eq!(ctx.get("build.number"), &Value::Int(12));
        assert_eq!(ctx.get("build.tag"), &Value::Null);
    }
}
