//! Result materialization: rows to instance trees, then deduplication.

mod instance;
mod merge;
mod row;

pub use instance::{DefaultFactory, Instance, InstanceFactory, Related};
pub use merge::MergeEngine;
pub use row::{ResultRow, RowMaterializer};
