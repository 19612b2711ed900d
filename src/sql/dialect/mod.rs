//! SQL Dialect definitions and formatting rules.
//!
//! This module provides a trait-based abstraction for the dialect differences
//! that matter to compiled relation queries:
//!
//! - Identifier quoting: `"` (PG/DuckDB/SQLite), `` ` `` (MySQL)
//! - Bound parameter placeholders: `$n` vs `?`
//! - Boolean literals: true/false vs 1/0
//! - Case-insensitive matching: native ILIKE vs `LOWER(..) LIKE LOWER(..)`
//!
//! # Usage
//!
//! ```ignore
//! use graft::sql::dialect::{Dialect, SqlDialect};
//!
//! let dialect = Dialect::Postgres;
//! let quoted = dialect.quote_identifier("user");  // "user"
//! let ph = dialect.placeholder(2);                // $2
//! ```

mod duckdb;
pub mod helpers;
mod mysql;
mod postgres;
mod sqlite;

pub use duckdb::DuckDb;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use serde::{Deserialize, Serialize};

use super::token::TokenStream;

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// Implementations handle dialect-specific syntax differences.
/// The default implementations follow ANSI SQL where possible.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    /// Quote an identifier (table, column, alias).
    ///
    /// - PostgreSQL/DuckDB/SQLite: `"identifier"`
    /// - MySQL: `` `identifier` ``
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a string literal.
    ///
    /// All dialects use single quotes with `''` for escaping.
    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    /// Format a boolean literal.
    ///
    /// - PostgreSQL/DuckDB: `true`/`false`
    /// - MySQL/SQLite: `1`/`0`
    fn format_bool(&self, b: bool) -> &'static str;

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Placeholder for the 1-based bound parameter `index`.
    ///
    /// - PostgreSQL/DuckDB: `$1`, `$2`, ...
    /// - MySQL/SQLite: `?`
    fn placeholder(&self, index: usize) -> String {
        let _ = index;
        "?".into()
    }

    // =========================================================================
    // Pagination
    // =========================================================================

    /// Emit LIMIT/OFFSET clause.
    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_standard(limit, offset)
    }

    // =========================================================================
    // Operators
    // =========================================================================

    /// Whether this dialect has a native case-insensitive `ILIKE`.
    ///
    /// Dialects without it get `LOWER(lhs) LIKE LOWER(rhs)`.
    fn supports_ilike(&self) -> bool {
        false
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    MySql,
    DuckDb,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Sqlite => &Sqlite,
            Dialect::Postgres => &Postgres,
            Dialect::MySql => &MySql,
            Dialect::DuckDb => &DuckDb,
        }
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        self.dialect().format_bool(b)
    }

    fn placeholder(&self, index: usize) -> String {
        self.dialect().placeholder(index)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        self.dialect().emit_limit_offset(limit, offset)
    }

    fn supports_ilike(&self) -> bool {
        self.dialect().supports_ilike()
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}
