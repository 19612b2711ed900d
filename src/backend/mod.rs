//! The execution boundary.
//!
//! The engine hands a backend one compiled statement at a time and gets
//! labelled rows back. Awaiting [`Backend::execute`] is the only point where
//! a query suspends; cancellation and timeouts belong to the implementation.

mod sqlite;

pub use sqlite::SqliteBackend;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::materialize::ResultRow;
use crate::planner::CompiledStatement;

/// Executes compiled statements.
///
/// Rows are keyed by the column labels of the statement's select list.
/// Driver failures are returned as [`BackendError`] and surface to callers
/// unchanged.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, statement: &CompiledStatement) -> Result<Vec<ResultRow>, BackendError>;
}

