//! # Graft
//!
//! A relation-graph query compiler and result materializer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        QuerySet (filters, paths, projection, order)      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [path + filter + excludable]
//! ┌─────────────────────────────────────────────────────────┐
//! │     Resolved paths, bound predicates, projection tree    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [alias + planner]
//! ┌─────────────────────────────────────────────────────────┐
//! │        One join statement (+ JoinTree for slicing)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [backend]
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Flat labelled rows                     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [materialize: rows → instances → merge]
//! ┌─────────────────────────────────────────────────────────┐
//! │      Deduplicated instance trees (+ prefetch levels)     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod alias;
pub mod backend;
pub mod config;
pub mod error;
pub mod excludable;
pub mod filter;
pub mod materialize;
pub mod path;
pub mod planner;
pub mod prefetch;
pub mod queryset;
pub mod schema;
pub mod sql;
pub mod value;

pub use alias::{Alias, AliasRegistry, AliasScope};
pub use backend::{Backend, SqliteBackend};
pub use config::EngineSettings;
pub use error::{BackendError, ConstructError, QueryError, QueryResult, SchemaError, SchemaResult};
pub use excludable::{ExcludableSet, FieldSelection};
pub use filter::{Filter, ValueRef};
pub use materialize::{DefaultFactory, Instance, InstanceFactory, Related, ResultRow};
pub use path::{Operator, OrderSpec, RelationPath};
pub use planner::{CompiledStatement, JoinPlanner, QueryRequest};
pub use queryset::{CompiledQuery, Engine, QuerySet};
pub use schema::{EntityDef, EntityId, RelationDef, RelationId, RelationKind, Schema};
pub use sql::Dialect;
pub use value::Value;
