//! SQL Tokens - the atomic units of SQL output.
//!
//! Tokens are dialect-agnostic representations that serialize
//! to dialect-specific strings. Bound parameters travel inside the
//! stream as [`Token::Param`] so placeholders and their values can never
//! drift apart.

use super::dialect::{Dialect, SqlDialect};
use crate::value::Value;

/// SQL Token - every element a compiled SELECT can contain.
///
/// Adding a new variant here will cause compile errors everywhere
/// it needs to be handled (exhaustive matching).
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // === Keywords ===
    Select,
    From,
    Where,
    And,
    Or,
    Not,
    As,
    On,
    Join,
    Left,
    Outer,
    GroupBy,
    OrderBy,
    Asc,
    Desc,
    Limit,
    Offset,
    In,
    Like,
    ILike,
    Escape,
    IsNull,
    IsNotNull,
    Distinct,
    True,
    False,

    // === Punctuation ===
    Comma,
    Dot,
    LParen,
    RParen,

    // === Operators ===
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,

    // === Whitespace / Formatting ===
    Space,
    Newline,
    Indent(usize),

    // === Dynamic Content ===
    /// Simple identifier (table, column, alias)
    Ident(String),
    /// Integer literal
    LitInt(i64),
    /// String literal
    LitString(String),
    /// Boolean literal
    LitBool(bool),
    /// NULL literal
    LitNull,
    /// Bound parameter. Rendered as the dialect placeholder, value collected
    /// separately by [`TokenStream::build`].
    Param(Value),

    /// Function name, rendered uppercase.
    FunctionName(String),
}

impl Token {
    /// Serialize this token to a string for the given dialect.
    ///
    /// `param_index` is the 1-based position used if this token is a
    /// bound parameter.
    fn serialize_at(&self, dialect: Dialect, param_index: usize) -> String {
        match self {
            // Keywords
            Token::Select => "SELECT".into(),
            Token::From => "FROM".into(),
            Token::Where => "WHERE".into(),
            Token::And => "AND".into(),
            Token::Or => "OR".into(),
            Token::Not => "NOT".into(),
            Token::As => "AS".into(),
            Token::On => "ON".into(),
            Token::Join => "JOIN".into(),
            Token::Left => "LEFT".into(),
            Token::Outer => "OUTER".into(),
            Token::GroupBy => "GROUP BY".into(),
            Token::OrderBy => "ORDER BY".into(),
            Token::Asc => "ASC".into(),
            Token::Desc => "DESC".into(),
            Token::Limit => "LIMIT".into(),
            Token::Offset => "OFFSET".into(),
            Token::In => "IN".into(),
            Token::Like => "LIKE".into(),
            Token::ILike => "ILIKE".into(),
            Token::Escape => "ESCAPE".into(),
            Token::IsNull => "IS NULL".into(),
            Token::IsNotNull => "IS NOT NULL".into(),
            Token::Distinct => "DISTINCT".into(),
            Token::True => dialect.format_bool(true).into(),
            Token::False => dialect.format_bool(false).into(),

            // Punctuation
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),

            // Operators
            Token::Eq => "=".into(),
            Token::Ne => "<>".into(),
            Token::Lt => "<".into(),
            Token::Gt => ">".into(),
            Token::Lte => "<=".into(),
            Token::Gte => ">=".into(),

            // Whitespace
            Token::Space => " ".into(),
            Token::Newline => "\n".into(),
            Token::Indent(n) => "  ".repeat(*n),

            // Dynamic - dialect-specific formatting
            Token::Ident(name) => dialect.quote_identifier(name),
            Token::LitInt(n) => n.to_string(),
            Token::LitString(s) => dialect.quote_string(s),
            Token::LitBool(b) => dialect.format_bool(*b).into(),
            Token::LitNull => "NULL".into(),
            Token::Param(_) => dialect.placeholder(param_index),

            Token::FunctionName(name) => name.to_uppercase(),
        }
    }

    /// Serialize a single token. Parameters render as the first placeholder.
    pub fn serialize(&self, dialect: Dialect) -> String {
        self.serialize_at(dialect, 1)
    }
}

/// A stream of tokens that can be serialized to SQL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    /// Create an empty token stream.
    pub fn new() -> Self {
        Self { tokens: vec![] }
    }

    /// Push a single token.
    pub fn push(&mut self, token: Token) -> &mut Self {
        self.tokens.push(token);
        self
    }

    /// Extend with multiple tokens.
    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) -> &mut Self {
        self.tokens.extend(tokens);
        self
    }

    /// Append another token stream.
    pub fn append(&mut self, other: &TokenStream) -> &mut Self {
        self.tokens.extend(other.tokens.iter().cloned());
        self
    }

    /// Serialize all tokens to a SQL string, discarding parameter values.
    pub fn serialize(&self, dialect: Dialect) -> String {
        self.build(dialect).0
    }

    /// Serialize to SQL text and collect bound parameters in placeholder order.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        for token in &self.tokens {
            if let Token::Param(value) = token {
                params.push(value.clone());
            }
            sql.push_str(&token.serialize_at(dialect, params.len()));
        }
        (sql, params)
    }

    // Convenience methods for common tokens
    pub fn space(&mut self) -> &mut Self {
        self.push(Token::Space)
    }
    pub fn newline(&mut self) -> &mut Self {
        self.push(Token::Newline)
    }
    pub fn indent(&mut self, n: usize) -> &mut Self {
        self.push(Token::Indent(n))
    }
    pub fn comma(&mut self) -> &mut Self {
        self.push(Token::Comma)
    }
    pub fn lparen(&mut self) -> &mut Self {
        self.push(Token::LParen)
    }
    pub fn rparen(&mut self) -> &mut Self {
        self.push(Token::RParen)
    }
}
