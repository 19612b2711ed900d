//! Expression AST - the core of SQL expression building.
//!
//! This module provides a strongly-typed AST for SQL expressions
//! with exhaustive pattern matching enforced by the compiler.

use super::dialect::{Dialect, SqlDialect};
use super::token::{Token, TokenStream};
use crate::value::Value;

// =============================================================================
// Expression AST
// =============================================================================

/// A SQL expression.
///
/// Every variant must be handled in `to_tokens()` - the compiler enforces this.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference: optional_table.column
    Column {
        table: Option<String>,
        column: String,
    },

    /// Inline literal values
    Literal(Literal),

    /// Bound parameter, emitted as a dialect placeholder.
    Param(Value),

    /// Binary operation: left op right
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },

    /// Unary operation: op expr
    UnaryOp { op: UnaryOperator, expr: Box<Expr> },

    /// Function call: name(args...)
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },

    /// IN: expr IN (values...)
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// IN subquery: expr IN (SELECT ...)
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<super::query::Query>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE with ESCAPE: expr LIKE pattern ESCAPE escape_char
    ///
    /// With `case_insensitive` set, dialects with native ILIKE emit it;
    /// the rest lower both sides.
    LikeEscape {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        escape_char: char,
        negated: bool,
        case_insensitive: bool,
    },

    /// Parenthesized expression
    Paren(Box<Expr>),
}

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    String(String),
    Bool(bool),
    Null,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    // Logical
    And,
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
}

impl Expr {
    /// Convert this expression to a token stream (default dialect).
    pub fn to_tokens(&self) -> TokenStream {
        self.to_tokens_for_dialect(Dialect::default())
    }

    /// Convert this expression to a token stream for a specific dialect.
    pub fn to_tokens_for_dialect(&self, dialect: Dialect) -> TokenStream {
        let mut ts = TokenStream::new();

        match self {
            Expr::Column { table, column } => {
                if let Some(t) = table {
                    ts.push(Token::Ident(t.clone()));
                    ts.push(Token::Dot);
                }
                ts.push(Token::Ident(column.clone()));
            }

            Expr::Literal(lit) => {
                ts.push(match lit {
                    Literal::Int(n) => Token::LitInt(*n),
                    Literal::String(s) => Token::LitString(s.clone()),
                    Literal::Bool(b) => Token::LitBool(*b),
                    Literal::Null => Token::LitNull,
                });
            }

            Expr::Param(value) => {
                ts.push(Token::Param(value.clone()));
            }

            Expr::BinaryOp { left, op, right } => {
                ts.append(&left.to_tokens_for_dialect(dialect));
                ts.space();
                ts.push(binary_op_to_token(*op));
                ts.space();
                ts.append(&right.to_tokens_for_dialect(dialect));
            }

            Expr::UnaryOp { op, expr } => {
                ts.push(match op {
                    UnaryOperator::Not => Token::Not,
                });
                ts.space();
                ts.append(&expr.to_tokens_for_dialect(dialect));
            }

            Expr::Function {
                name,
                args,
                distinct,
            } => {
                ts.push(Token::FunctionName(name.clone()));
                ts.lparen();
                if *distinct {
                    ts.push(Token::Distinct).space();
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        ts.comma().space();
                    }
                    ts.append(&arg.to_tokens_for_dialect(dialect));
                }
                ts.rparen();
            }

            Expr::In {
                expr,
                values,
                negated,
            } => {
                // Empty IN list: "x IN ()" is invalid SQL
                // "x IN ()" should be FALSE, "x NOT IN ()" should be TRUE
                if values.is_empty() {
                    ts.push(if *negated { Token::True } else { Token::False });
                } else {
                    ts.append(&expr.to_tokens_for_dialect(dialect));
                    if *negated {
                        ts.space().push(Token::Not);
                    }
                    ts.space().push(Token::In).space().lparen();
                    for (i, val) in values.iter().enumerate() {
                        if i > 0 {
                            ts.comma().space();
                        }
                        ts.append(&val.to_tokens_for_dialect(dialect));
                    }
                    ts.rparen();
                }
            }

            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                ts.append(&expr.to_tokens_for_dialect(dialect));
                if *negated {
                    ts.space().push(Token::Not);
                }
                ts.space().push(Token::In).space().lparen();
                ts.append(&subquery.to_tokens_for_dialect(dialect));
                ts.rparen();
            }

            Expr::IsNull { expr, negated } => {
                ts.append(&expr.to_tokens_for_dialect(dialect));
                ts.space();
                ts.push(if *negated {
                    Token::IsNotNull
                } else {
                    Token::IsNull
                });
            }

            Expr::LikeEscape {
                expr,
                pattern,
                escape_char,
                negated,
                case_insensitive,
            } => {
                let native_ilike = *case_insensitive && dialect.supports_ilike();
                let lowered = *case_insensitive && !native_ilike;

                emit_maybe_lowered(&mut ts, expr, lowered, dialect);
                if *negated {
                    ts.space().push(Token::Not);
                }
                ts.space()
                    .push(if native_ilike { Token::ILike } else { Token::Like })
                    .space();
                emit_maybe_lowered(&mut ts, pattern, lowered, dialect);
                ts.space()
                    .push(Token::Escape)
                    .space()
                    .push(Token::LitString(escape_char.to_string()));
            }

            Expr::Paren(inner) => {
                ts.lparen();
                ts.append(&inner.to_tokens_for_dialect(dialect));
                ts.rparen();
            }
        }

        ts
    }
}

fn emit_maybe_lowered(ts: &mut TokenStream, expr: &Expr, lowered: bool, dialect: Dialect) {
    if lowered {
        ts.push(Token::FunctionName("LOWER".into())).lparen();
        ts.append(&expr.to_tokens_for_dialect(dialect));
        ts.rparen();
    } else {
        ts.append(&expr.to_tokens_for_dialect(dialect));
    }
}

fn binary_op_to_token(op: BinaryOperator) -> Token {
    match op {
        BinaryOperator::Eq => Token::Eq,
        BinaryOperator::Ne => Token::Ne,
        BinaryOperator::Lt => Token::Lt,
        BinaryOperator::Gt => Token::Gt,
        BinaryOperator::Lte => Token::Lte,
        BinaryOperator::Gte => Token::Gte,
        BinaryOperator::And => Token::And,
        BinaryOperator::Or => Token::Or,
    }
}

// =============================================================================
// Expression Constructors
// =============================================================================

/// Create a column reference.
pub fn col(name: &str) -> Expr {
    Expr::Column {
        table: None,
        column: name.into(),
    }
}

/// Create a qualified column reference (table.column).
pub fn table_col(table: &str, column: &str) -> Expr {
    Expr::Column {
        table: Some(table.into()),
        column: column.into(),
    }
}

/// Create a bound parameter.
pub fn param(value: Value) -> Expr {
    Expr::Param(value)
}

/// Create an integer literal.
pub fn lit_int(n: i64) -> Expr {
    Expr::Literal(Literal::Int(n))
}

/// Create a string literal.
pub fn lit_str(s: &str) -> Expr {
    Expr::Literal(Literal::String(s.into()))
}

/// Create a boolean literal.
pub fn lit_bool(b: bool) -> Expr {
    Expr::Literal(Literal::Bool(b))
}

/// COUNT(DISTINCT expr)
pub fn count_distinct(expr: Expr) -> Expr {
    Expr::Function {
        name: "COUNT".into(),
        args: vec![expr],
        distinct: true,
    }
}

/// MIN(expr)
pub fn min(expr: Expr) -> Expr {
    Expr::Function {
        name: "MIN".into(),
        args: vec![expr],
        distinct: false,
    }
}

/// MAX(expr)
pub fn max(expr: Expr) -> Expr {
    Expr::Function {
        name: "MAX".into(),
        args: vec![expr],
        distinct: false,
    }
}

/// Join expressions with AND, parenthesizing OR operands.
///
/// An empty list yields `None`.
pub fn and_all(exprs: Vec<Expr>) -> Option<Expr> {
    exprs
        .into_iter()
        .map(|e| match e {
            Expr::BinaryOp {
                op: BinaryOperator::Or,
                ..
            } => Expr::Paren(Box::new(e)),
            other => other,
        })
        .reduce(|acc, e| acc.and(e))
}

/// Join expressions with OR, parenthesizing AND operands.
pub fn or_all(exprs: Vec<Expr>) -> Option<Expr> {
    exprs
        .into_iter()
        .map(|e| match e {
            Expr::BinaryOp {
                op: BinaryOperator::And,
                ..
            } => Expr::Paren(Box::new(e)),
            other => other,
        })
        .reduce(|acc, e| acc.or(e))
}

// =============================================================================
// Expression Builder Trait
// =============================================================================

/// Extension trait for building expressions fluently.
pub trait ExprExt: Sized {
    fn into_expr(self) -> Expr;

    // Comparison operators
    fn eq(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Eq,
            right: Box::new(other.into()),
        }
    }

    fn ne(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Ne,
            right: Box::new(other.into()),
        }
    }

    fn gt(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Gt,
            right: Box::new(other.into()),
        }
    }

    fn gte(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Gte,
            right: Box::new(other.into()),
        }
    }

    fn lt(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Lt,
            right: Box::new(other.into()),
        }
    }

    fn lte(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Lte,
            right: Box::new(other.into()),
        }
    }

    // Logical operators
    fn and(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::And,
            right: Box::new(other.into()),
        }
    }

    fn or(self, other: impl Into<Expr>) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self.into_expr()),
            op: BinaryOperator::Or,
            right: Box::new(other.into()),
        }
    }

    fn not(self) -> Expr {
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(Expr::Paren(Box::new(self.into_expr()))),
        }
    }

    /// LIKE with ESCAPE clause for matching literal `%` and `_` characters.
    fn like_escape(self, pattern: impl Into<Expr>, escape_char: char) -> Expr {
        Expr::LikeEscape {
            expr: Box::new(self.into_expr()),
            pattern: Box::new(pattern.into()),
            escape_char,
            negated: false,
            case_insensitive: false,
        }
    }

    /// Case-insensitive LIKE with ESCAPE clause.
    fn ilike_escape(self, pattern: impl Into<Expr>, escape_char: char) -> Expr {
        Expr::LikeEscape {
            expr: Box::new(self.into_expr()),
            pattern: Box::new(pattern.into()),
            escape_char,
            negated: false,
            case_insensitive: true,
        }
    }

    // NULL checks
    #[allow(clippy::wrong_self_convention)]
    fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self.into_expr()),
            negated: false,
        }
    }

    #[allow(clippy::wrong_self_convention)]
    fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self.into_expr()),
            negated: true,
        }
    }

    // IN operator
    fn in_list(self, values: Vec<Expr>) -> Expr {
        Expr::In {
            expr: Box::new(self.into_expr()),
            values,
            negated: false,
        }
    }

    fn in_subquery(self, subquery: super::query::Query) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self.into_expr()),
            subquery: Box::new(subquery),
            negated: false,
        }
    }

    /// Alias this expression (for SELECT list).
    fn alias(self, name: &str) -> super::query::SelectExpr {
        super::query::SelectExpr {
            expr: self.into_expr(),
            alias: Some(name.into()),
        }
    }
}

impl ExprExt for Expr {
    fn into_expr(self) -> Expr {
        self
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        lit_int(n)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        lit_str(s)
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        lit_bool(b)
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        param(v)
    }
}

// =============================================================================
// Tests
// =============================================================================
