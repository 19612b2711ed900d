//! SQLite backend over rusqlite.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};

use super::Backend;
use crate::error::BackendError;
use crate::materialize::ResultRow;
use crate::planner::CompiledStatement;
use crate::value::Value;

/// A single SQLite connection.
///
/// Statements run on tokio's blocking pool, one at a time; concurrent
/// callers queue on the connection.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run raw SQL, e.g. DDL and fixtures.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        lock(&self.conn)?.execute_batch(sql)?;
        Ok(())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, BackendError> {
    conn.lock()
        .map_err(|_| BackendError::new("sqlite connection lock poisoned"))
}

fn run(conn: &Mutex<Connection>, statement: &CompiledStatement) -> Result<Vec<ResultRow>, BackendError> {
    let conn = lock(conn)?;
    let mut stmt = conn.prepare_cached(&statement.sql)?;
    let labels: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = ResultRow::with_capacity(labels.len());
        for (idx, label) in labels.iter().enumerate() {
            record.insert(label.clone(), from_sqlite(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(out)
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn execute(&self, statement: &CompiledStatement) -> Result<Vec<ResultRow>, BackendError> {
        tracing::debug!(
            target: "graft.query",
            sql = %statement.sql,
            params = statement.params.len(),
            "executing statement"
        );
        let conn = Arc::clone(&self.conn);
        let statement = statement.clone();
        let rows = tokio::task::spawn_blocking(move || run(&conn, &statement))
            .await
            .map_err(BackendError::new)??;
        tracing::trace!(target: "graft.query", rows = rows.len(), "statement returned");
        Ok(rows)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b))),
            Value::Int(n) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*n)),
            Value::Float(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int(n),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}
