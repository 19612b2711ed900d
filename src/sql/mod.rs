//! SQL generation module.
//!
//! This module provides a type-safe SQL builder that generates multi-dialect SQL.
//! It includes:
//!
//! - [`query`] - SELECT query builder
//! - [`expr`] - Expression AST and builder DSL
//! - [`token`] - Token types for SQL generation
//! - [`dialect`] - SQL dialect implementations

pub mod dialect;
pub mod expr;
pub mod query;
pub mod token;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types at the sql module level
pub use dialect::{Dialect, SqlDialect};
pub use expr::{
    and_all, col, count_distinct, lit_bool, lit_int, lit_str, max, min, or_all, param, table_col,
    BinaryOperator, Expr, ExprExt, Literal, UnaryOperator,
};
pub use query::{
    Join, LimitOffset, OrderByExpr, Query, SelectExpr, SortDir, TableRef, TableSource,
};
pub use token::{Token, TokenStream};
