//! DuckDB SQL dialect.
//!
//! DuckDB is PostgreSQL-compatible for everything a relation query needs:
//! - ANSI identifier quoting (`"`)
//! - Numbered parameters (`$1`)
//! - Native ILIKE

use super::helpers;
use super::SqlDialect;

/// DuckDB SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    fn placeholder(&self, index: usize) -> String {
        helpers::placeholder_numbered(index)
    }

    fn supports_ilike(&self) -> bool {
        true
    }
}
