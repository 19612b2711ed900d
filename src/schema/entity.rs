//! Entity type descriptors.

use std::collections::HashMap;

use super::RelationId;

/// A mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Field name used in lookups and on instances.
    pub name: String,
    /// Column name in the backing table.
    pub db_name: String,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            db_name: name.clone(),
            name,
            nullable: false,
        }
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Immutable descriptor of a mapped table.
///
/// Created by [`SchemaBuilder`](super::SchemaBuilder); never mutated once the
/// schema is built.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    /// Primary-key field name.
    pub pk: String,
    pub columns: Vec<Column>,
    pub(crate) relations: Vec<RelationId>,
    pub(crate) relation_names: HashMap<String, RelationId>,
}

impl EntityType {
    pub(crate) fn new(name: String, table: String, pk: String, columns: Vec<Column>) -> Self {
        Self {
            name,
            table,
            pk,
            columns,
            relations: Vec::new(),
            relation_names: HashMap::new(),
        }
    }

    /// Look up a column by field name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn pk_column(&self) -> &Column {
        // The builder guarantees the pk is one of the columns.
        self.columns
            .iter()
            .find(|c| c.name == self.pk)
            .unwrap_or(&self.columns[0])
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Relation by name.
    pub fn relation(&self, name: &str) -> Option<RelationId> {
        self.relation_names.get(name).copied()
    }

    /// Relations in declaration order (forward relations first as declared,
    /// mirrors in the order their owners were declared).
    pub fn relations(&self) -> &[RelationId] {
        &self.relations
    }
}
