//! Error types for schema construction, query compilation and execution.

use std::error::Error as StdError;
use thiserror::Error;

/// Result type for schema construction.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Result type for query compilation and execution.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors raised while building a [`Schema`](crate::schema::Schema).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("unknown column `{column}` on {entity}")]
    UnknownColumn { entity: String, column: String },

    /// Also raised when two mirror edges would take the same name on one target.
    #[error("duplicate relation `{relation}` on {entity}")]
    DuplicateRelation { entity: String, relation: String },

    #[error("entity {0} has no primary key column")]
    MissingPrimaryKey(String),
}

/// Errors raised by the instance factory.
#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("missing required field `{field}` on {entity}")]
    MissingField { entity: String, field: String },

    #[error("cannot construct {entity}: {source}")]
    Custom {
        entity: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// Opaque error from the backend boundary, carried verbatim.
#[derive(Debug, Error)]
#[error("backend execution failed: {source}")]
pub struct BackendError {
    #[source]
    source: Box<dyn StdError + Send + Sync>,
}

impl BackendError {
    /// Wrap any driver error.
    pub fn new(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The driver error this wraps.
    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.source
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        Self::new(err)
    }
}

/// Errors raised while compiling or executing a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A path segment names a relation that does not exist.
    #[error("unknown relation `{segment}` in path `{path}`")]
    UnknownRelation { path: String, segment: String },

    #[error("unknown field `{field}` on {entity}")]
    UnknownField { entity: String, field: String },

    #[error("unknown operator `{operator}` in lookup `{lookup}`")]
    UnknownOperator { lookup: String, operator: String },

    #[error("invalid value for lookup `{lookup}`: {reason}")]
    InvalidLookupValue { lookup: String, reason: String },

    /// Two join paths ended up on one alias. Internal invariant violation.
    #[error("alias `{alias}` assigned to more than one join path: {}", paths.join(", "))]
    AmbiguousAlias { alias: String, paths: Vec<String> },

    #[error("cannot exclude required field `{field}` on {entity}")]
    ExcludedRequiredField { entity: String, field: String },

    #[error("no {entity} matches the given query")]
    NoMatchingRows { entity: String },

    #[error("expected one {entity}, found {count}")]
    MultipleMatchingRows { entity: String, count: usize },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Construct(#[from] ConstructError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl QueryError {
    pub fn unknown_relation(path: impl Into<String>, segment: impl Into<String>) -> Self {
        Self::UnknownRelation {
            path: path.into(),
            segment: segment.into(),
        }
    }

    pub fn unknown_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    pub fn invalid_value(lookup: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLookupValue {
            lookup: lookup.into(),
            reason: reason.into(),
        }
    }

    /// True for errors detected before any statement runs.
    pub fn is_compile_error(&self) -> bool {
        !matches!(
            self,
            Self::Backend(_)
                | Self::Construct(_)
                | Self::NoMatchingRows { .. }
                | Self::MultipleMatchingRows { .. }
        )
    }
}
